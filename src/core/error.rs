use super::types::ObjectId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Unknown object type tag {tag} for object {object_id}")]
    UnknownObjectType { object_id: ObjectId, tag: u8 },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    #[error("Nonstop timeout: {operation} did not complete within {timeout_ms}ms")]
    NonStopTimeout { operation: String, timeout_ms: u64 },

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Replication error: {0}")]
    ReplicationError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl GraphError {
    /// Topology or programmer errors that must never be retried or absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GraphError::AssertionFailed(_)
                | GraphError::IllegalState(_)
                | GraphError::UnknownObjectType { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GraphError::NonStopTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl<T> From<std::sync::PoisonError<T>> for GraphError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for GraphError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for GraphError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(GraphError::AssertionFailed("x".into()).is_fatal());
        assert!(GraphError::UnknownObjectType { object_id: ObjectId(1), tag: 99 }.is_fatal());
        assert!(!GraphError::UnsupportedOperation("x".into()).is_fatal());

        let timeout = GraphError::NonStopTimeout {
            operation: "get".into(),
            timeout_ms: 1000,
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_fatal());
        assert_eq!(
            timeout.to_string(),
            "Nonstop timeout: get did not complete within 1000ms"
        );
    }
}
