//! SQL scalar functions that let `SQLite` see inside stored values.
//!
//! Index expressions and compiled queries call the extraction functions
//! through [`generate_extract_sql`](kvschema_core::utils::generate_extract_sql),
//! so their names and argument order are fixed by the core crate.

use kvschema_core::types::ValueSource;
use kvschema_core::utils::{
    parse_and_check_field_path, FLATBUFFER_EXTRACT_FUNC_NAME, JSON_EXTRACT_FUNC_NAME,
};
use kvschema_core::{FieldType, FieldValue, SchemaError, SchemaObject, SchemaType, ValueObject};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::{Value, ValueRef};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub const CALC_HASH_KEY_FUNC_NAME: &str = "calc_hash_key";

const JSON_EXTRACT_CHECK_SQL: &str = "SELECT json_extract_by_path('{\"a\":0}', '$.a', 0);";

fn flags() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
}

fn user_error(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(err.into())
}

/// Registers `calc_hash_key` and, unless the connection already provides
/// it, `json_extract_by_path`.
///
/// # Errors
///
/// Propagates `SQLite` registration failures.
pub fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(CALC_HASH_KEY_FUNC_NAME, 1, flags(), calc_hash_key)?;
    if conn.prepare(JSON_EXTRACT_CHECK_SQL).is_ok() {
        info!("{JSON_EXTRACT_FUNC_NAME} already provided");
        return Ok(());
    }
    conn.create_scalar_function(JSON_EXTRACT_FUNC_NAME, 3, flags(), json_extract_by_path)?;
    debug!("sql functions registered");
    Ok(())
}

/// Binds `flatbuffer_extract_by_path` to `schema`, or removes it when
/// `schema` is not a FlatBuffer schema.
///
/// # Errors
///
/// Fails when `SQLite` refuses the registration, e.g. while a statement
/// using the function is still running.
pub fn register_flatbuffer_function(conn: &Connection, schema: &SchemaObject) -> rusqlite::Result<()> {
    if schema.schema_type() != SchemaType::FlatBuffer {
        conn.remove_function(FLATBUFFER_EXTRACT_FUNC_NAME, 3)?;
        debug!("{FLATBUFFER_EXTRACT_FUNC_NAME} removed");
        return Ok(());
    }
    let schema = schema.clone();
    conn.create_scalar_function(FLATBUFFER_EXTRACT_FUNC_NAME, 3, flags(), move |ctx| {
        flatbuffer_extract_by_path(&schema, ctx)
    })?;
    debug!("{FLATBUFFER_EXTRACT_FUNC_NAME} registered");
    Ok(())
}

/// The stored value argument. Deleted rows carry no value and are never
/// passed in by generated SQL.
pub(crate) fn value_arg<'a>(ctx: &'a Context<'_>, idx: usize) -> rusqlite::Result<&'a [u8]> {
    let bytes = match ctx.get_raw(idx) {
        ValueRef::Blob(b) | ValueRef::Text(b) => b,
        _ => &[],
    };
    if bytes.is_empty() {
        warn!("extraction on a deleted record");
        return Err(user_error("deleted record not allowed"));
    }
    Ok(bytes)
}

fn skip_arg(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = ctx.get(idx)?;
    u32::try_from(raw).map_err(|_| {
        warn!(offset = raw, "invalid skip size argument");
        user_error(format!("invalid offset {raw}"))
    })
}

/// SQL representation of an extracted scalar.
pub(crate) fn field_value_to_sql(value: FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Integer(i64::from(b)),
        FieldValue::Integer(i) => Value::Integer(i64::from(i)),
        FieldValue::Long(l) => Value::Integer(l),
        FieldValue::Double(d) => Value::Real(d),
        FieldValue::String(s) => Value::Text(s),
    }
}

fn calc_hash_key(ctx: &Context<'_>) -> rusqlite::Result<Vec<u8>> {
    let key = match ctx.get_raw(0) {
        ValueRef::Blob(b) | ValueRef::Text(b) => b,
        _ => {
            warn!("calc_hash_key needs a key blob");
            return Err(user_error("invalid key"));
        }
    };
    Ok(Sha256::digest(key).to_vec())
}

fn json_extract_by_path(ctx: &Context<'_>) -> rusqlite::Result<Value> {
    let value = value_arg(ctx, 0)?;
    let path: String = ctx.get(1)?;
    let skip = skip_arg(ctx, 2)?;
    let path = parse_and_check_field_path(&path).map_err(|e| {
        warn!(path = %path, error = %e, "illegal extraction path");
        user_error(e)
    })?;
    let object = ValueObject::parse(value, skip).map_err(|e| {
        warn!(error = %e, "stored value does not parse");
        user_error(e)
    })?;
    let field_type = match object.field_type(&path) {
        Ok(t) => t,
        Err(SchemaError::NotFound(_)) => return Ok(Value::Null),
        Err(e) => return Err(user_error(e)),
    };
    if matches!(
        field_type,
        FieldType::Null | FieldType::Array | FieldType::LeafObject | FieldType::InternalObject
    ) {
        return Ok(Value::Null);
    }
    object
        .field_value(&path)
        .map(field_value_to_sql)
        .map_err(user_error)
}

fn flatbuffer_extract_by_path(schema: &SchemaObject, ctx: &Context<'_>) -> rusqlite::Result<Value> {
    let value = value_arg(ctx, 0)?;
    let path: String = ctx.get(1)?;
    let skip = skip_arg(ctx, 2)?;
    if skip != schema.skip_size() {
        warn!(offset = skip, skip_size = schema.skip_size(), "offset differs from skip size");
        return Err(user_error(format!(
            "offset {skip} differs from skip size {}",
            schema.skip_size()
        )));
    }
    schema
        .extract_value(ValueSource::FromDbfile, &path, value)
        .map(field_value_to_sql)
        .map_err(user_error)
}

#[cfg(test)]
mod tests {
    use kvschema_core::bfbs::testkit::{build_value, FieldSpec, ObjectSpec, SchemaSpec, ValueEntry};
    use kvschema_core::bfbs::BaseType;
    use proptest::prelude::*;

    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();
        conn
    }

    fn extract(conn: &Connection, value: &str, path: &str, skip: i64) -> rusqlite::Result<Value> {
        conn.query_row(
            "SELECT json_extract_by_path(?1, ?2, ?3)",
            rusqlite::params![value.as_bytes(), path, skip],
            |row| row.get(0),
        )
    }

    #[test]
    fn json_extract_returns_typed_scalars() {
        let conn = conn();
        let doc = r#"{"b":true,"i":7,"l":5000000000,"d":1.5,"s":"x","o":{"n":null},"a":[1]}"#;
        assert_eq!(extract(&conn, doc, "$.b", 0).unwrap(), Value::Integer(1));
        assert_eq!(extract(&conn, doc, "i", 0).unwrap(), Value::Integer(7));
        assert_eq!(extract(&conn, doc, "$.l", 0).unwrap(), Value::Integer(5_000_000_000));
        assert_eq!(extract(&conn, doc, "$.d", 0).unwrap(), Value::Real(1.5));
        assert_eq!(extract(&conn, doc, "$.s", 0).unwrap(), Value::Text("x".into()));
        assert_eq!(extract(&conn, doc, "$.o", 0).unwrap(), Value::Null);
        assert_eq!(extract(&conn, doc, "$.o.n", 0).unwrap(), Value::Null);
        assert_eq!(extract(&conn, doc, "$.a", 0).unwrap(), Value::Null);
        assert_eq!(extract(&conn, doc, "$.missing", 0).unwrap(), Value::Null);
    }

    #[test]
    fn json_extract_honours_skip_and_rejects_garbage() {
        let conn = conn();
        assert_eq!(
            extract(&conn, r#"XY{"a":3}"#, "$.a", 2).unwrap(),
            Value::Integer(3)
        );
        assert!(extract(&conn, r#"{"a":3}"#, "$.a", -1).is_err());
        assert!(extract(&conn, r#"{"a":3}"#, "$$a", 0).is_err());
        assert!(extract(&conn, "not json", "$.a", 0).is_err());
        assert!(extract(&conn, "", "$.a", 0).is_err());
    }

    #[test]
    fn registration_is_idempotent() {
        let conn = conn();
        register_functions(&conn).unwrap();
        assert!(conn.prepare(JSON_EXTRACT_CHECK_SQL).is_ok());
    }

    #[test]
    fn hash_key_is_sha256() {
        let conn = conn();
        let digest: Vec<u8> = conn
            .query_row("SELECT calc_hash_key(?1)", [b"abc".to_vec()], |row| row.get(0))
            .unwrap();
        assert_eq!(digest.len(), 32);
        assert_eq!(&digest[..4], &[0xba, 0x78, 0x16, 0xbf]);
        assert!(conn
            .query_row("SELECT calc_hash_key(NULL)", [], |row| row.get::<_, Vec<u8>>(0))
            .is_err());
    }

    #[test]
    fn flatbuffer_function_skipped_for_json_schemas() {
        let conn = conn();
        let schema = SchemaObject::parse(
            r#"{"SCHEMA_VERSION":"1.0","SCHEMA_MODE":"STRICT","SCHEMA_DEFINE":{"a":"INTEGER"}}"#,
        )
        .unwrap();
        register_flatbuffer_function(&conn, &schema).unwrap();
        assert!(conn
            .prepare("SELECT flatbuffer_extract_by_path(x'00', '$.a', 0)")
            .is_err());
    }

    fn flatbuffer_schema(skip: Option<&str>) -> SchemaObject {
        let mut root = ObjectSpec::versioned_root("Root")
            .field(FieldSpec::scalar("n", BaseType::Int, 0))
            .field(FieldSpec::scalar("s", BaseType::String, 1))
            .field(FieldSpec::scalar("d", BaseType::Double, 2).default_real(2.5));
        if let Some(skip) = skip {
            root = root.attr("SCHEMA_SKIPSIZE", Some(skip));
        }
        SchemaObject::parse(SchemaSpec::new(root).build()).unwrap()
    }

    fn fb_extract(conn: &Connection, value: &[u8], path: &str, skip: i64) -> rusqlite::Result<Value> {
        conn.query_row(
            "SELECT flatbuffer_extract_by_path(?1, ?2, ?3)",
            rusqlite::params![value, path, skip],
            |row| row.get(0),
        )
    }

    #[test]
    fn flatbuffer_extract_reads_root_fields() {
        let conn = conn();
        register_flatbuffer_function(&conn, &flatbuffer_schema(Some("3"))).unwrap();
        let mut value = b"abc".to_vec();
        value.extend(build_value(&[(0, ValueEntry::Int(-4)), (1, ValueEntry::Str("hey".into()))]));

        assert_eq!(fb_extract(&conn, &value, "$.n", 3).unwrap(), Value::Integer(-4));
        assert_eq!(fb_extract(&conn, &value, "$.s", 3).unwrap(), Value::Text("hey".into()));
        assert_eq!(fb_extract(&conn, &value, "$.d", 3).unwrap(), Value::Real(2.5));
        // The offset must equal the schema skip size.
        assert!(fb_extract(&conn, &value, "$.n", 0).is_err());
        assert!(fb_extract(&conn, &value[..value.len() - 2], "$.n", 3).is_err());
        assert!(fb_extract(&conn, b"", "$.n", 3).is_err());
    }

    #[test]
    fn flatbuffer_function_follows_the_schema_type() {
        let conn = conn();
        register_flatbuffer_function(&conn, &flatbuffer_schema(None)).unwrap();
        let value = build_value(&[(0, ValueEntry::Int(9))]);
        assert_eq!(fb_extract(&conn, &value, "$.n", 0).unwrap(), Value::Integer(9));

        let json = SchemaObject::parse(
            r#"{"SCHEMA_VERSION":"1.0","SCHEMA_MODE":"STRICT","SCHEMA_DEFINE":{"a":"INTEGER"}}"#,
        )
        .unwrap();
        register_flatbuffer_function(&conn, &json).unwrap();
        assert!(conn
            .prepare("SELECT flatbuffer_extract_by_path(x'00', '$.a', 0)")
            .is_err());
    }

    #[test]
    fn sql_values_follow_field_types() {
        assert_eq!(field_value_to_sql(FieldValue::Bool(false)), Value::Integer(0));
        assert_eq!(field_value_to_sql(FieldValue::Integer(-3)), Value::Integer(-3));
        assert_eq!(field_value_to_sql(FieldValue::Null), Value::Null);
    }

    proptest! {
        #[test]
        fn json_extract_preserves_integers(n in any::<i64>(), prefix in "[a-z]{0,8}") {
            let conn = conn();
            let doc = format!("{prefix}{{\"n\":{n}}}");
            let skip = i64::try_from(prefix.len()).unwrap();
            prop_assert_eq!(extract(&conn, &doc, "$.n", skip).unwrap(), Value::Integer(n));
        }
    }
}
