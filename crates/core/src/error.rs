use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Not found: {entity} '{key}'")]
    NotFound { entity: &'static str, key: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Malformed document '{key}': {message}")]
    Malformed { key: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}
