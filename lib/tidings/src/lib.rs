//! Symmetric, length-prefixed binary message protocol between a multi-client
//! server and many clients.
//!
//! Both peers share a process-wide registry of message definitions; a
//! definition fixes the numeric id, argument order and binary layout of one
//! message type, so two processes that register identical definitions in
//! identical order produce identical bytes. On top of the codec sit the
//! server-side connection lifecycle (salted login handshake, version
//! negotiation, ping/pong keepalive, per-user connection limits, dispatch to
//! a single [`Room`](net::Room) handler) and a matching client.
//!
//! The server runs three workers: the [`Listener`](net) accepts sockets, the
//! Manager owns every live connection and drives its state machine, and the
//! Room worker hands authenticated traffic to user code. All sockets are
//! non-blocking; partial frames survive across ticks inside the
//! [`MessageReader`](codec::MessageReader) and
//! [`MessageWriter`](codec::MessageWriter).

pub mod codec;
pub mod error;
pub mod net;

use std::time::Duration;

pub use crate::codec::{DefinitionList, Kind, Message, MessageDefinition, MessageReader, MessageWriter, Value};
pub use crate::error::{ClientError, ConfigError, FatalError, ProtocolError, WireError};
pub use crate::net::{
    Client, ClientConfig, ClientStatus, ConnectionHandle, Room, Server, ServerConfig, Timeouts, User,
    UserValidator, VersionValidator,
};

/// Default TCP port for servers and clients.
pub const DEFAULT_PORT: u16 = 12121;

/// Maximum simultaneous connections a single user may hold.
pub const MAX_CONNECTIONS_PER_USER: usize = 1;

/// Silence on a connection before the server sends a ping.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period for the pong after a ping went out.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a freshly welcomed client gets to complete the login exchange.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

// Worker sleep intervals. None of these may be zero: every loop must yield
// between cycles.
pub const SLEEP_ROOM: Duration = Duration::from_micros(1);
pub const SLEEP_MANAGER: Duration = Duration::from_micros(1);
pub const SLEEP_LISTENER: Duration = Duration::from_millis(200);
pub const SLEEP_SERVER: Duration = Duration::from_millis(500);
pub const SLEEP_SHUTDOWN: Duration = Duration::from_secs(1);
pub const SLEEP_HANDSHAKE: Duration = Duration::from_millis(100);
pub const SLEEP_RECEIVE_BLOCKING: Duration = Duration::from_millis(10);
pub const SLEEP_CLIENT_RUN: Duration = Duration::from_millis(10);
pub const SLEEP_START_BLOCKING: Duration = Duration::from_millis(100);
