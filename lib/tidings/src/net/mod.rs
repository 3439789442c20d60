//! Connection lifecycle: the server's three workers, the per-connection
//! state machine, and the matching client.

pub mod client;
pub mod connection;
pub mod listener;
pub mod manager;
pub mod room;
pub mod server;
pub mod user;

pub use self::client::{Client, ClientConfig, ClientStatus};
pub use self::connection::ConnectionHandle;
pub use self::room::{Room, RoomEvent};
pub use self::server::{Server, ServerConfig, Timeouts, UserValidator, VersionValidator};
pub use self::user::User;
