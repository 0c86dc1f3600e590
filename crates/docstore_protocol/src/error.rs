//! Error types for the protocol layer.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or parsing wire messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A document-scoped command was built without an id.
    #[error("{command} command requires a non-empty id")]
    EmptyId {
        /// Wire tag of the command being built.
        command: &'static str,
    },

    /// A field had an unexpected shape.
    #[error("invalid field '{field}': {message}")]
    InvalidField {
        /// Field name.
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub(crate) fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::EmptyId { command: "PUT" };
        assert_eq!(err.to_string(), "PUT command requires a non-empty id");

        let err = ProtocolError::invalid_field("Document", "expected an object");
        assert!(err.to_string().contains("Document"));
        assert!(err.to_string().contains("expected an object"));
    }
}
