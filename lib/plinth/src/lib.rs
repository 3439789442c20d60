//! Shared infrastructure for the `tidings` workspace: logging plumbing and
//! the credential digest used during login.

pub mod digest;
pub mod logging;
