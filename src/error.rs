//! Error types for the sync and balance engine
//!
//! Display strings are surfaced to tool callers, so no variant ever carries
//! credential material, ciphertext or key bytes.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Aggregator Errors
    // =============================

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Rate limited by aggregator: {0}")]
    RateLimited(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Item requires re-authentication: {0}")]
    ItemError(String),

    // =============================
    // Engine Errors
    // =============================

    #[error("Credential integrity check failed: {0}")]
    Integrity(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Cursor conflict for item {0}")]
    CursorConflict(String),

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Coarse classification handed to tool callers
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCredential,
    RateLimited,
    TransientNetwork,
    ItemError,
    Integrity,
    Validation,
    Storage,
    NotFound,
    Conflict,
    InvalidInput,
    Config,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidCredential(_) => ErrorKind::InvalidCredential,
            EngineError::RateLimited(_) => ErrorKind::RateLimited,
            EngineError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            EngineError::ItemError(_) => ErrorKind::ItemError,
            EngineError::Integrity(_) => ErrorKind::Integrity,
            EngineError::Validation(_) | EngineError::Serialization(_) => ErrorKind::Validation,
            EngineError::Storage(_) | EngineError::Io(_) | EngineError::Database(_) => {
                ErrorKind::Storage
            }
            EngineError::ItemNotFound(_) | EngineError::ToolNotFound(_) => ErrorKind::NotFound,
            EngineError::CursorConflict(_) => ErrorKind::Conflict,
            EngineError::InvalidToolInput(_) => ErrorKind::InvalidInput,
            EngineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the caller may retry the whole invocation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::TransientNetwork | ErrorKind::Conflict
        )
    }

    /// Whether the aggregator is telling us the item has to be re-linked.
    pub fn requires_relink(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidCredential(_) | EngineError::ItemError(_)
        )
    }
}

/// Structured error body returned by tools instead of raw error text
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::RateLimited("429".into()).is_retryable());
        assert!(EngineError::TransientNetwork("timeout".into()).is_retryable());
        assert!(!EngineError::Integrity("tag mismatch".into()).is_retryable());
        assert!(!EngineError::InvalidCredential("revoked".into()).is_retryable());
        assert!(!EngineError::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn test_error_body_serialization() {
        let err = EngineError::Validation("duplicate transaction id".into());
        let body = ErrorBody::from(&err);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "validation");
        assert_eq!(json["retryable"], false);
        assert!(json["message"].as_str().unwrap().contains("duplicate"));
    }
}
