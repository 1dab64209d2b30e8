//! Store Error Types

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence backend errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient backend failure worth retrying (I/O hiccup,
    /// connection drop)
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Non-transient backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Session does not exist
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        // Disk and filesystem errors are treated as transient; the
        // retry policy bounds how long we care.
        Self::Transient(err.to_string())
    }
}

impl From<StoreError> for gateway_core::GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => Self::PersistenceTransient(msg),
            StoreError::NotFound(id) => Self::Persistence(format!("session not found: {id}")),
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Transient("io".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_maps_into_gateway_error() {
        let err: gateway_core::GatewayError = StoreError::Transient("io".into()).into();
        assert!(err.is_retryable());

        let err: gateway_core::GatewayError = StoreError::Backend("corrupt".into()).into();
        assert!(!err.is_retryable());
    }
}
