//! Storage error type.

use kvschema_core::SchemaError;

/// Errors raised by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid database: {0}")]
    InvalidDb(String),
    #[error("schema not found in database")]
    SchemaNotFound,
    #[error("schema is incompatible with the stored schema")]
    SchemaIncompatible,
    #[error("value violates schema: {0}")]
    ValueViolation(String),
}

impl StorageError {
    /// The core error behind this one, if any.
    #[must_use]
    pub fn schema_error(&self) -> Option<&SchemaError> {
        match self {
            Self::Schema(e) => Some(e),
            _ => None,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
