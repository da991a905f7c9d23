use kvschema_core::types::{IndexInfo, IndexName};
use kvschema_core::{SchemaObject, SchemaType};

use crate::error::StorageResult;

/// Storage operations a schema upgrade is driven through.
///
/// Implementations: [`SqliteSchemaEngine`](crate::SqliteSchemaEngine), and
/// recording mocks in tests.
pub trait SchemaStorage {
    /// The persisted schema, or `None` for a plain KV database.
    ///
    /// # Errors
    ///
    /// The parse error when the persisted schema no longer parses.
    fn get_schema(&self) -> StorageResult<Option<SchemaObject>>;

    /// Persists `schema` as the current schema.
    fn save_schema(&self, schema: &SchemaObject) -> StorageResult<()>;

    /// Creates the index `name` over the extracted fields in `info`.
    fn increase_index(
        &self,
        name: &IndexName,
        info: &IndexInfo,
        schema_type: SchemaType,
        skip_size: u32,
    ) -> StorageResult<()>;

    /// Drops the index `name` if it exists.
    fn decrease_index(&self, name: &IndexName) -> StorageResult<()>;

    /// Rebuilds the index `name` with a new field list.
    fn change_index(
        &self,
        name: &IndexName,
        info: &IndexInfo,
        schema_type: SchemaType,
        skip_size: u32,
    ) -> StorageResult<()> {
        self.decrease_index(name)?;
        self.increase_index(name, info, schema_type, skip_size)
    }

    /// Checks every live value against `schema`, rewriting the ones that
    /// needed amendment. Returns the number of rewritten rows.
    ///
    /// # Errors
    ///
    /// [`StorageError::ValueViolation`](crate::StorageError::ValueViolation)
    /// naming the first value that fails `schema`.
    fn upgrade_values(&self, schema: &SchemaObject) -> StorageResult<usize>;
}
