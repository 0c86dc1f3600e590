//! Error types for the client.

use docstore_protocol::ProtocolError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while using a session or its collaborators.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Programmer misuse, e.g. creating a compare-exchange key twice.
    #[error("illegal state: {message}")]
    IllegalState {
        /// What was attempted and on which key.
        message: String,
    },

    /// An argument was rejected.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// The server rejected a command because the expected version was stale.
    #[error("concurrency violation on {ids:?}: {message}")]
    Concurrency {
        /// Server message.
        message: String,
        /// Conflicting document ids or compare-exchange keys.
        ids: Vec<String>,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the request can be retried.
        retryable: bool,
    },

    /// Server rejected the request. Not retried.
    #[error("server error: {0}")]
    ServerError(String),

    /// Response had an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cancellation was requested or the deadline passed.
    #[error("operation cancelled")]
    Cancelled,

    /// An asynchronous server operation failed.
    #[error("operation {id} faulted: {message}")]
    OperationFaulted {
        /// Operation id.
        id: i64,
        /// Failure message.
        message: String,
    },

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The document store was closed.
    #[error("document store is closed")]
    Closed,
}

impl ClientError {
    /// Creates an illegal-state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Creates a concurrency error for `ids`.
    pub fn concurrency(message: impl Into<String>, ids: Vec<String>) -> Self {
        Self::Concurrency {
            message: message.into(),
            ids,
        }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport { retryable: true, .. })
    }

    /// Returns true for optimistic-concurrency conflicts.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, ClientError::Concurrency { .. })
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::EmptyId { .. } => ClientError::IllegalState {
                message: err.to_string(),
            },
            ProtocolError::Json(json) => ClientError::Serialization(json),
            other => ClientError::IllegalArgument(other.to_string()),
        }
    }
}
