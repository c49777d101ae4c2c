//! Broker error types for typed error handling.
//!
//! Library code returns [`Error`]; the binary and configuration loading
//! layer wrap these in `anyhow` with additional context.

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broker errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A client line failed the message grammar or carried invalid JSON.
    #[error("{0}")]
    Protocol(String),

    /// Pop against an empty queue. Never surfaced to clients.
    #[error("can't pop an item from an empty queue")]
    EmptyQueue,

    /// Malformed administrative command on the control channel.
    #[error("{0}")]
    Admin(String),

    /// Underlying SQLite failure. Always fatal to the broker.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The broker actor has stopped and no longer accepts requests.
    #[error("broker is no longer running")]
    BrokerGone,
}

impl Error {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an administrative input error.
    pub fn admin(message: impl Into<String>) -> Self {
        Self::Admin(message.into())
    }

    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error must take the whole broker down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::BrokerGone)
    }
}
