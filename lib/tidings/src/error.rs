use crate::codec::Kind;
use std::error::Error;
use std::io;
use thiserror::Error;

/// Any error a server worker can die with. Stored on the server and
/// surfaced when it is joined.
pub type FatalError = Box<dyn Error + Send + Sync>;

/// Errors in the binary encoding of a single message or frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message id {0}")]
    UnknownId(u32),
    #[error("message \"{0}\" is not registered")]
    Unregistered(String),
    #[error("message \"{message}\" has no argument \"{argument}\"")]
    UnknownArgument { message: String, argument: String },
    #[error("argument \"{argument}\" holds a different kind than {expected:?}")]
    KindMismatch { argument: String, expected: Kind },
    #[error("message \"{message}\" is missing a value for \"{argument}\"")]
    MissingArgument { message: String, argument: String },
    #[error("frame length {0} outside the accepted range")]
    BadLength(u32),
    #[error("message body ends before all arguments were read")]
    Truncated,
    #[error("{0} unread bytes after the last argument")]
    TrailingBytes(usize),
    #[error("argument \"{argument}\" is not valid UTF-8")]
    InvalidUtf8 { argument: String },
    #[error("vector argument \"{argument}\" has {len} payload bytes, not a multiple of {element}")]
    UnevenVector { argument: String, len: usize, element: usize },
}

/// Errors raised while assembling the message-definition registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("message \"{0}\" already defined")]
    DuplicateDefinition(String),
    #[error("invalid message name \"{0}\"")]
    BadMessageName(String),
    #[error("invalid argument name \"{0}\"")]
    BadArgumentName(String),
    #[error("message \"{message}\" declares argument \"{argument}\" twice")]
    DuplicateArgument { message: String, argument: String },
    #[error("unknown argument type \"{token}\" on line {line}")]
    UnknownType { line: usize, token: String },
    #[error("malformed definition on line {line}: {text}")]
    BadLine { line: usize, text: String },
    #[error("cannot read definition file: {0}")]
    Io(#[from] io::Error),
}

/// Errors on an established byte stream. A would-block condition is never an
/// error here: readers and writers report it as lack of progress instead.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("socket closed unexpectedly")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors surfaced by the client to its caller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unable to connect: {0}")]
    Connect(io::Error),
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error("expected {expected:?}, got \"{got}\"")]
    UnexpectedMessage { expected: Vec<String>, got: String },
    #[error("client shut down while waiting for a message")]
    Halted,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        ClientError::Wire(WireError::Protocol(err))
    }
}
