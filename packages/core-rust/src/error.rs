//! Error type shared by every fallible schema, value, and query operation.
//!
//! Compare outcomes and successful value checks are not errors; see
//! [`SchemaCompareResult`](crate::types::SchemaCompareResult) and
//! [`ValueCheckResult`](crate::types::ValueCheckResult).

/// Errors produced by the schema core.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema parse failed: {0}")]
    SchemaParseFail(String),
    #[error("json parse failed: {0}")]
    JsonParseFail(String),
    #[error("invalid argument: {0}")]
    InvalidArgs(String),
    #[error("operation not permitted: {0}")]
    NotPermit(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not supported: {0}")]
    NotSupport(String),
    #[error("invalid query format: {0}")]
    InvalidQueryFormat(String),
    #[error("invalid query field: {0}")]
    InvalidQueryField(String),
    #[error("limit exceeded: {0}")]
    MaxLimits(String),
    #[error("flatbuffer verification failed: {0}")]
    FlatBufferVerifyFail(String),
    #[error("value has more fields than schema allows: {0}")]
    ValueMismatchFieldCount(String),
    #[error("value field type mismatch: {0}")]
    ValueMismatchFieldType(String),
    #[error("value violates constraint: {0}")]
    ValueMismatchConstraint(String),
    #[error("json path already exists: {0}")]
    JsonInsertPathExist(String),
    #[error("json path conflicts with a non-object node: {0}")]
    JsonInsertPathConflict(String),
    #[error("json path not found: {0}")]
    JsonDeletePathNotFound(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SchemaError {
    /// Returns `true` when the error reports a value that does not conform
    /// to the schema (as opposed to a malformed input or internal failure).
    #[must_use]
    pub fn is_value_mismatch(&self) -> bool {
        matches!(
            self,
            Self::ValueMismatchFieldCount(_)
                | Self::ValueMismatchFieldType(_)
                | Self::ValueMismatchConstraint(_)
        )
    }

    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        Self::SchemaParseFail(msg.into())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(anyhow::anyhow!("{msg}"))
    }
}

impl From<flatbuffers::InvalidFlatbuffer> for SchemaError {
    fn from(err: flatbuffers::InvalidFlatbuffer) -> Self {
        Self::FlatBufferVerifyFail(err.to_string().trim_end().to_string())
    }
}

/// Convenience alias used throughout the core crate.
pub type SchemaResult<T> = Result<T, SchemaError>;
