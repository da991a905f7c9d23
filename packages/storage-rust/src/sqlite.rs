//! `SQLite` implementation of [`SchemaStorage`]: table layout, schema
//! metadata, index DDL, and the bulk value upgrade.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use kvschema_core::types::{IndexInfo, IndexName, ValueCheckResult, ValueSource};
use kvschema_core::utils::generate_extract_sql;
use kvschema_core::{SchemaError, SchemaObject, SchemaType, ValueObject};
use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::functions::value_arg;
use crate::traits::SchemaStorage;

/// Key of the persisted schema in `meta_data`.
pub const SCHEMA_META_KEY: &[u8] = b"schemaKey";
/// `PRAGMA user_version` of databases written by this crate.
pub const DB_USER_VERSION: i64 = 1;
/// Row flag marking a deleted entry.
pub const FLAG_DELETED: i64 = 0x01;

const CREATE_TABLES_SQL: &str = "CREATE TABLE IF NOT EXISTS meta_data(key BLOB PRIMARY KEY, value BLOB);
     CREATE TABLE IF NOT EXISTS sync_data(key BLOB PRIMARY KEY NOT NULL, value BLOB, \
     timestamp INT NOT NULL, flag INT NOT NULL);";

const CHECK_FUNC_NAME: &str = "schema_check_value";
const AMEND_FUNC_NAME: &str = "schema_amend_value";
const UPGRADE_VALUES_SQL: &str = "UPDATE sync_data SET value=schema_amend_value(value) \
     WHERE (flag&0x01=0) AND schema_check_value(value)!=0;";

/// Creates the tables of a fresh database, or validates the version of an
/// existing one.
///
/// # Errors
///
/// [`StorageError::InvalidDb`] when the database was written by a newer
/// version of this crate.
pub fn initialize(conn: &Connection) -> StorageResult<()> {
    let version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if version > DB_USER_VERSION {
        warn!(version, "database written by a newer version");
        return Err(StorageError::InvalidDb(format!(
            "user_version {version} newer than {DB_USER_VERSION}"
        )));
    }
    conn.execute_batch(CREATE_TABLES_SQL)?;
    if version < DB_USER_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {DB_USER_VERSION};"))?;
        debug!(from = version, to = DB_USER_VERSION, "database version set");
    }
    Ok(())
}

/// `CREATE INDEX` statement for a schema index.
///
/// # Errors
///
/// `NotPermit` for an empty name or field list.
pub fn increase_index_sql(
    name: &IndexName,
    info: &IndexInfo,
    schema_type: SchemaType,
    skip_size: u32,
) -> StorageResult<String> {
    if name.is_empty() {
        return Err(SchemaError::NotPermit("index name can not be empty".into()).into());
    }
    if info.is_empty() {
        return Err(SchemaError::NotPermit(format!("index {name} has no fields")).into());
    }
    let mut columns = Vec::with_capacity(info.len());
    for (path, field_type) in info {
        let extract = generate_extract_sql(schema_type, path, *field_type, skip_size);
        if extract.is_empty() {
            warn!(index = %name, field = %path, "no extract sql for index field");
            return Err(SchemaError::internal(format!("index {name} field {path}")).into());
        }
        columns.push(extract);
    }
    Ok(format!(
        "CREATE INDEX IF NOT EXISTS '{name}' ON sync_data ({}) WHERE (flag&0x01=0);",
        columns.join(", ")
    ))
}

/// `DROP INDEX` statement for a schema index.
///
/// # Errors
///
/// `NotPermit` for an empty name.
pub fn decrease_index_sql(name: &IndexName) -> StorageResult<String> {
    if name.is_empty() {
        return Err(SchemaError::NotPermit("index name can not be empty".into()).into());
    }
    Ok(format!("DROP INDEX IF EXISTS '{name}';"))
}

/// [`SchemaStorage`] over one `SQLite` connection (or transaction).
pub struct SqliteSchemaEngine<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteSchemaEngine<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Registers the check/amend pair used by [`UPGRADE_VALUES_SQL`]. The
    /// first violation found by the check function is recorded in
    /// `violation`.
    fn register_upgrade_functions(
        &self,
        schema: &SchemaObject,
        violation: &Arc<Mutex<Option<String>>>,
    ) -> rusqlite::Result<()> {
        let checker = schema.clone();
        let found = AssertUnwindSafe(Arc::clone(violation));
        self.conn.create_scalar_function(
            CHECK_FUNC_NAME,
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            move |ctx| {
                let value = value_arg(ctx, 0)?;
                check_value(&checker, value).map_err(|e| {
                    found.lock().get_or_insert_with(|| e.to_string());
                    rusqlite::Error::UserFunctionError(e.into())
                })
            },
        )?;
        let amender = schema.clone();
        self.conn
            .create_scalar_function(AMEND_FUNC_NAME, 1, FunctionFlags::SQLITE_UTF8, move |ctx| {
                let value = value_arg(ctx, 0)?;
                amend_value(&amender, value).map_err(|e| rusqlite::Error::UserFunctionError(e.into()))
            })
    }

    /// Best effort: either function may be missing after a failed
    /// registration.
    fn remove_upgrade_functions(&self) {
        for name in [CHECK_FUNC_NAME, AMEND_FUNC_NAME] {
            if let Err(e) = self.conn.remove_function(name, 1) {
                warn!(function = name, error = %e, "cannot remove upgrade function");
            }
        }
    }
}

/// `0` when the value conforms as stored, `1` when it needs amendment.
fn check_value(schema: &SchemaObject, value: &[u8]) -> Result<i64, SchemaError> {
    match schema.schema_type() {
        SchemaType::Json => {
            let mut object = ValueObject::parse(value, schema.skip_size())?;
            match schema.check_value_and_amend_if_need(ValueSource::FromDbfile, &mut object)? {
                ValueCheckResult::Match => Ok(0),
                ValueCheckResult::MatchAmended => Ok(1),
            }
        }
        SchemaType::FlatBuffer => {
            schema.verify_value(ValueSource::FromDbfile, value)?;
            Ok(0)
        }
        other => Err(SchemaError::NotSupport(format!("value check on {other} schema"))),
    }
}

fn amend_value(schema: &SchemaObject, value: &[u8]) -> Result<Vec<u8>, SchemaError> {
    if schema.schema_type() != SchemaType::Json {
        return Ok(value.to_vec());
    }
    let mut object = ValueObject::parse(value, schema.skip_size())?;
    schema.check_value_and_amend_if_need(ValueSource::FromDbfile, &mut object)?;
    Ok(object.to_bytes())
}

impl SchemaStorage for SqliteSchemaEngine<'_> {
    fn get_schema(&self) -> StorageResult<Option<SchemaObject>> {
        let raw: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM meta_data WHERE key=?1;",
                [SCHEMA_META_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => Ok(Some(SchemaObject::parse(raw).inspect_err(|e| {
                warn!(error = %e, "stored schema does not parse");
            })?)),
        }
    }

    fn save_schema(&self, schema: &SchemaObject) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta_data (key, value) VALUES (?1, ?2);",
            params![SCHEMA_META_KEY, schema.schema_bytes()],
        )?;
        info!(schema_type = %schema.schema_type(), "schema saved");
        Ok(())
    }

    fn increase_index(
        &self,
        name: &IndexName,
        info: &IndexInfo,
        schema_type: SchemaType,
        skip_size: u32,
    ) -> StorageResult<()> {
        let sql = increase_index_sql(name, info, schema_type, skip_size)?;
        self.conn.execute_batch(&sql)?;
        info!(index = %name, "index created");
        Ok(())
    }

    fn decrease_index(&self, name: &IndexName) -> StorageResult<()> {
        let sql = decrease_index_sql(name)?;
        self.conn.execute_batch(&sql)?;
        info!(index = %name, "index dropped");
        Ok(())
    }

    fn upgrade_values(&self, schema: &SchemaObject) -> StorageResult<usize> {
        let violation = Arc::new(Mutex::new(None));
        let result = self
            .register_upgrade_functions(schema, &violation)
            .and_then(|()| self.conn.execute(UPGRADE_VALUES_SQL, []))
            .map_err(|e| match violation.lock().take() {
                Some(reason) => {
                    warn!(%reason, "stored value violates schema");
                    StorageError::ValueViolation(reason)
                }
                None => StorageError::Sqlite(e),
            });
        self.remove_upgrade_functions();
        let rewritten = result?;
        debug!(rewritten, "values upgraded");
        Ok(rewritten)
    }
}
