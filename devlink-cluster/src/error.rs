//! Error types for the cluster broker

use thiserror::Error;

/// Cluster broker error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// No reply arrived for a message id within its window
    #[error("Timed out waiting for reply to message {0}")]
    TimedOut(String),

    /// Message without a usable correlation id
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The waiter's bounded buffer refused a reply
    #[error("Reply buffer full for message {0}")]
    ReplyBufferFull(String),

    #[error("A reply waiter is already registered for message {0}")]
    DuplicateWaiter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for broker operations
pub type Result<T> = std::result::Result<T, Error>;
