//! Defines basic error and result types used throughout the application.

use std::{error::Error, fmt};

use redis::RedisError;

/// Result type used throughout the application.
pub type RusqueResult<T> = Result<T, RusqueError>;

/// Error type used throughout the application.
#[derive(Debug)]
pub enum RusqueError {
    /// Error occurred during interaction with Redis.
    Transport(RedisError),

    /// Error occurred while trying to establish a connection to Redis.
    Connection(String),

    /// Caller provided job arguments that are not a mapping.
    InvalidArgument(String),

    /// No handler registered under the requested job class name.
    HandlerNotFound(String),

    /// A handler (or its set up/tear down) returned an error.
    Handler(String),

    /// A job's child execution was killed, panicked, or ended without
    /// reporting an outcome.
    DirtyExit(String),

    /// Parsing of some data structure failed. Typically used when decoding JSON.
    Parse(String),
}

impl RusqueError {
    /// Construct a new RusqueError::Handler with given message.
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        RusqueError::Handler(msg.into())
    }

    /// Construct a new RusqueError::DirtyExit with given message.
    pub fn dirty_exit<S: Into<String>>(msg: S) -> Self {
        RusqueError::DirtyExit(msg.into())
    }

    /// Short name identifying the error kind, stored in the `exception` field
    /// of persisted failure records.
    pub fn exception_kind(&self) -> &'static str {
        match self {
            RusqueError::Transport(_) => "TransportError",
            RusqueError::Connection(_) => "ConnectionError",
            RusqueError::InvalidArgument(_) => "InvalidArgument",
            RusqueError::HandlerNotFound(_) => "HandlerNotFound",
            RusqueError::Handler(_) => "HandlerError",
            RusqueError::DirtyExit(_) => "DirtyExitError",
            RusqueError::Parse(_) => "ParseError",
        }
    }
}

impl From<RedisError> for RusqueError {
    fn from(err: RedisError) -> Self {
        RusqueError::Transport(err)
    }
}

impl From<serde_json::Error> for RusqueError {
    fn from(err: serde_json::Error) -> Self {
        RusqueError::Parse(err.to_string())
    }
}

impl fmt::Display for RusqueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RusqueError::Transport(err) => err.fmt(f),
            RusqueError::Connection(msg) => write!(f, "Failed to connect to Redis: {}", msg),
            RusqueError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            RusqueError::HandlerNotFound(class) => {
                write!(f, "No handler registered for class '{}'", class)
            }
            RusqueError::Handler(msg) => write!(f, "Handler error: {}", msg),
            RusqueError::DirtyExit(msg) => write!(f, "Job execution exited dirty: {}", msg),
            RusqueError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl Error for RusqueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RusqueError::Transport(err) => Some(err),
            _ => None,
        }
    }
}
