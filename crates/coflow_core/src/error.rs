use serde::Serialize;
use thiserror::Error;

/// Unified error type for coflow operations.
#[derive(Debug, Error)]
pub enum CoflowError {
    /// A proposed field value failed schema constraints. Surfaced synchronously
    /// at the command boundary, never recorded in the undo ledger.
    #[error("validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// An operation would produce an invalid document (dangling edge,
    /// duplicate id, unknown node). Rejected before any mutation.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// CRDT encode/decode/apply failure.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// Channel-level failure: disconnect, timeout, malformed server reply.
    /// These are transient; callers may retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected a command for lack of permission. Not retryable.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A request/reply exchange failed with a server-reported error.
    #[error("rpc '{method}' failed: {message}")]
    Rpc { method: String, message: String },

    /// Malformed wire frame.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CoflowError {
    /// Whether the caller should be offered a retry action.
    ///
    /// Only transient transport failures qualify; validation, integrity and
    /// authorization errors are final for the given input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoflowError::Transport(_))
    }

    /// Convert to a serializable representation for IPC.
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// Result type alias for coflow operations.
pub type Result<T> = std::result::Result<T, CoflowError>;

/// A serializable representation of CoflowError for IPC boundaries.
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Whether a retry action should be offered
    pub retryable: bool,
}

impl From<&CoflowError> for SerializableError {
    fn from(err: &CoflowError) -> Self {
        let kind = match err {
            CoflowError::Validation { .. } => "Validation",
            CoflowError::Integrity(_) => "Integrity",
            CoflowError::Crdt(_) => "Crdt",
            CoflowError::Transport(_) => "Transport",
            CoflowError::Unauthorized(_) => "Unauthorized",
            CoflowError::Rpc { .. } => "Rpc",
            CoflowError::Protocol(_) => "Protocol",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<CoflowError> for SerializableError {
    fn from(err: CoflowError) -> Self {
        SerializableError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoflowError::Transport("socket closed".into()).is_retryable());
        assert!(!CoflowError::Unauthorized("read-only session".into()).is_retryable());
        assert!(
            !CoflowError::Validation {
                field: "name".into(),
                message: "too long".into()
            }
            .is_retryable()
        );
        assert!(!CoflowError::Integrity("dangling edge".into()).is_retryable());
    }

    #[test]
    fn test_serializable_error() {
        let err = CoflowError::Rpc {
            method: "save_workflow".into(),
            message: "denied".into(),
        };
        let ser = err.to_serializable();
        assert_eq!(ser.kind, "Rpc");
        assert!(ser.message.contains("save_workflow"));
        assert!(!ser.retryable);
    }
}
