//! The message codec: definitions, values, and framed non-blocking I/O.

pub mod definition;
pub mod message;
pub mod reader;
pub mod writer;

pub use self::definition::{DefinitionList, Kind, MessageDefinition};
pub use self::message::{Message, Value};
pub use self::reader::MessageReader;
pub use self::writer::MessageWriter;

/// Upper bound on the body length accepted from the wire. Protects the
/// reader from allocating whatever a corrupt or hostile length prefix says.
pub(crate) const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// A body is at least the four byte message id.
pub(crate) const MIN_BODY_LEN: usize = 4;
