//! Structured queries over schema-checked values.
//!
//! A [`Query`] is assembled with the fluent builder, then wrapped in a
//! [`QueryObject`] bound to a [`SchemaObject`](crate::schema::SchemaObject),
//! which validates it and emits SQL for the storage layer.

mod compiler;
mod node;

pub use compiler::{QueryObject, SqlArg, INVALID_LIMIT};
pub use node::{Query, QueryObjNode, QueryObjType, QueryValue, QueryValueType};

/// Bounds enforced while compiling and binding a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLimits {
    /// Maximum length of the generated SQL in bytes.
    pub max_sql_len: usize,
    /// Maximum number of values in one `IN`/`NOT IN` list.
    pub max_conditions: usize,
    /// Maximum size of a bound string value in bytes.
    pub max_bind_size: usize,
    pub max_prefix_key_size: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_sql_len: 1024 * 1024,
            max_conditions: 128,
            max_bind_size: 50_000,
            max_prefix_key_size: crate::limits::MAX_KEY_SIZE,
        }
    }
}
