//! Error Types

use thiserror::Error;

/// Result type alias for datastore operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Datastore error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Insert collided with an existing unique key
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Row addressed by an update does not exist
    #[error("Row not found: {0}")]
    NotFound(String),

    /// Backend unreachable or timed out
    #[error("Datastore unavailable: {0}")]
    Unavailable(String),

    /// Row could not be (de)serialized
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// True when the error is the storage layer rejecting a duplicate key
    pub const fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(StoreError::Unavailable("down".into()).is_retryable());
        assert!(!StoreError::UniqueViolation("evt_1".into()).is_retryable());
        assert!(!StoreError::NotFound("ord_1".into()).is_retryable());
        assert!(!StoreError::Corrupt("bad".into()).is_retryable());
    }
}
