//! The schema-aware key-value store.
//!
//! [`SchemaStore`] owns one `SQLite` connection behind a lock. Every write
//! is checked against the current schema; reads go through the query
//! compiler of the core crate.

use std::time::{SystemTime, UNIX_EPOCH};

use kvschema_core::limits::{MAX_KEY_SIZE, MAX_VALUE_SIZE};
use kvschema_core::query::{Query, QueryObject, SqlArg};
use kvschema_core::types::{ValueCheckResult, ValueSource};
use kvschema_core::{SchemaError, SchemaObject, SchemaType, ValueObject};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::functions::{register_flatbuffer_function, register_functions};
use crate::sqlite::{self, SqliteSchemaEngine, FLAG_DELETED};
use crate::traits::SchemaStorage;
use crate::upgrader::{SchemaUpgrader, UpgradeReport};

/// A live key and its stored value.
pub type Entry = (Vec<u8>, Vec<u8>);

struct StoreInner {
    conn: Connection,
    schema: SchemaObject,
}

/// A key-value store whose values are checked against the database schema.
///
/// A database without a schema behaves as a plain KV store until
/// [`upgrade_schema`](Self::upgrade_schema) installs one. Values of a JSON
/// schema are amended with defaults on write; FlatBuffer values are
/// verified and stored as given.
pub struct SchemaStore {
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for SchemaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaStore")
            .field("schema_type", &self.inner.lock().schema.schema_type())
            .finish_non_exhaustive()
    }
}

fn open_connection(config: &StorageConfig) -> StorageResult<Connection> {
    let conn = match &config.path {
        None => Connection::open_in_memory()?,
        Some(path) => {
            let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            if config.create_if_missing {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
            Connection::open_with_flags(path, flags).inspect_err(|e| {
                warn!(path = %path.display(), error = %e, "cannot open database");
            })?
        }
    };
    let journal: String = conn.pragma_update_and_check(
        None,
        "journal_mode",
        config.journal_mode.pragma_value(),
        |row| row.get(0),
    )?;
    conn.pragma_update(None, "synchronous", config.sync_mode.pragma_value())?;
    debug!(%journal, "pragmas applied");
    conn.busy_timeout(config.busy_timeout())?;
    Ok(conn)
}

fn check_key(key: &[u8]) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(SchemaError::InvalidArgs(format!("key of {} bytes", key.len())).into());
    }
    Ok(())
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

fn to_sql(arg: SqlArg) -> Value {
    match arg {
        SqlArg::Integer(i) => Value::Integer(i),
        SqlArg::Double(d) => Value::Real(d),
        SqlArg::Text(s) => Value::Text(s),
        SqlArg::Blob(b) => Value::Blob(b),
    }
}

fn violation(err: SchemaError) -> StorageError {
    if err.is_value_mismatch() || matches!(err, SchemaError::FlatBufferVerifyFail(_)) {
        StorageError::ValueViolation(err.to_string())
    } else {
        StorageError::Schema(err)
    }
}

/// The bytes to store for `value` under `schema`: amended JSON, verified
/// FlatBuffer, or the value untouched for a KV database.
fn conform_value(schema: &SchemaObject, value: &[u8]) -> StorageResult<Vec<u8>> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(SchemaError::InvalidArgs(format!("value of {} bytes", value.len())).into());
    }
    let stored = match schema.schema_type() {
        SchemaType::Json => {
            let mut object = ValueObject::parse(value, schema.skip_size()).map_err(violation)?;
            match schema
                .check_value_and_amend_if_need(ValueSource::FromLocal, &mut object)
                .map_err(violation)?
            {
                ValueCheckResult::Match => value.to_vec(),
                ValueCheckResult::MatchAmended => object.to_bytes(),
            }
        }
        SchemaType::FlatBuffer => {
            schema
                .verify_value(ValueSource::FromLocal, value)
                .map_err(violation)?;
            value.to_vec()
        }
        _ => value.to_vec(),
    };
    if stored.len() > MAX_VALUE_SIZE {
        warn!(size = stored.len(), "amended value too large");
        return Err(SchemaError::InvalidArgs(format!("amended value of {} bytes", stored.len())).into());
    }
    Ok(stored)
}

impl SchemaStore {
    /// Opens (or creates) the database and brings it to the configured
    /// schema.
    ///
    /// # Errors
    ///
    /// [`StorageError::Sqlite`] when the file cannot be opened,
    /// [`StorageError::InvalidDb`] for a database of a newer version, and
    /// any error of [`upgrade_schema`](Self::upgrade_schema) for the
    /// configured schema.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let conn = open_connection(config)?;
        register_functions(&conn)?;
        sqlite::initialize(&conn)?;
        let schema = SqliteSchemaEngine::new(&conn).get_schema()?.unwrap_or_default();
        register_flatbuffer_function(&conn, &schema)?;
        let store = Self {
            inner: Mutex::new(StoreInner { conn, schema }),
        };
        if let Some(text) = &config.schema {
            store.upgrade_schema(text)?;
        }
        info!(path = ?config.path, "store opened");
        Ok(store)
    }

    /// The current schema.
    ///
    /// # Errors
    ///
    /// [`StorageError::SchemaNotFound`] for a plain KV database.
    pub fn schema(&self) -> StorageResult<SchemaObject> {
        let inner = self.inner.lock();
        if inner.schema.is_valid() {
            Ok(inner.schema.clone())
        } else {
            Err(StorageError::SchemaNotFound)
        }
    }

    /// Upgrades the database to `schema_text` in one transaction.
    ///
    /// On failure the transaction is rolled back and the extraction
    /// function is bound to the previous schema again.
    ///
    /// # Errors
    ///
    /// `SchemaParseFail` for unparseable text, and the errors of
    /// [`SchemaUpgrader::upgrade`].
    pub fn upgrade_schema(&self, schema_text: &str) -> StorageResult<UpgradeReport> {
        let new = SchemaObject::parse(schema_text)?;
        let mut inner = self.inner.lock();
        let tx = inner.conn.transaction()?;
        let report = register_flatbuffer_function(&tx, &new)
            .map_err(StorageError::from)
            .and_then(|()| SchemaUpgrader::new(&SqliteSchemaEngine::new(&tx)).upgrade(&new));
        let report = match report {
            Ok(report) => {
                tx.commit()?;
                report
            }
            Err(e) => {
                drop(tx);
                if let Err(restore) = register_flatbuffer_function(&inner.conn, &inner.schema) {
                    warn!(error = %restore, "cannot rebind extraction to the previous schema");
                }
                return Err(e);
            }
        };
        inner.schema = new;
        Ok(report)
    }

    /// Stores `value` under `key`, amending it with schema defaults where
    /// needed.
    ///
    /// # Errors
    ///
    /// `InvalidArgs` for an empty or oversized key or value, and
    /// [`StorageError::ValueViolation`] when the value does not conform.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        check_key(key)?;
        let inner = self.inner.lock();
        let stored = conform_value(&inner.schema, value)?;
        inner.conn.execute(
            "INSERT OR REPLACE INTO sync_data (key, value, timestamp, flag) VALUES (?1, ?2, ?3, 0);",
            params![key, stored, now_micros()],
        )?;
        debug!(key_len = key.len(), value_len = stored.len(), "put");
        Ok(())
    }

    /// The live value under `key`.
    ///
    /// # Errors
    ///
    /// `InvalidArgs` for an empty or oversized key.
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        check_key(key)?;
        let inner = self.inner.lock();
        let value = inner
            .conn
            .query_row(
                "SELECT value FROM sync_data WHERE key=?1 AND (flag&0x01=0);",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Marks the entry under `key` deleted.
    ///
    /// # Errors
    ///
    /// `NotFound` when no live entry exists.
    pub fn delete(&self, key: &[u8]) -> StorageResult<()> {
        check_key(key)?;
        let inner = self.inner.lock();
        let changed = inner.conn.execute(
            "UPDATE sync_data SET flag=flag|?2, value=NULL, timestamp=?3 WHERE key=?1 AND (flag&0x01=0);",
            params![key, FLAG_DELETED, now_micros()],
        )?;
        if changed == 0 {
            return Err(SchemaError::NotFound("no live entry for key".into()).into());
        }
        debug!(key_len = key.len(), "deleted");
        Ok(())
    }

    /// Live entries matching `query`.
    ///
    /// # Errors
    ///
    /// The query's validation error when it does not fit the schema.
    pub fn get_entries(&self, query: Query) -> StorageResult<Vec<Entry>> {
        let inner = self.inner.lock();
        let mut object = QueryObject::new(query).with_schema(&inner.schema);
        let sql = object.query_sql(false)?;
        let args = object.bind_args()?;
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.into_iter().map(to_sql)), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let entries = rows.collect::<Result<Vec<Entry>, _>>()?;
        debug!(count = entries.len(), "entries fetched");
        Ok(entries)
    }

    /// Number of live entries matching `query`.
    ///
    /// # Errors
    ///
    /// `NotSupport` when the query carries LIMIT or ORDER BY.
    pub fn get_count(&self, query: Query) -> StorageResult<usize> {
        let inner = self.inner.lock();
        let mut object = QueryObject::new(query).with_schema(&inner.schema);
        let sql = object.count_sql()?;
        if !object.is_count_valid() {
            return Err(SchemaError::NotSupport("count with limit or order by".into()).into());
        }
        let args = object.bind_args()?;
        let count: i64 = inner.conn.query_row(
            &sql,
            params_from_iter(args.into_iter().map(to_sql)),
            |row| row.get(0),
        )?;
        usize::try_from(count).map_err(|e| SchemaError::internal(e).into())
    }
}
