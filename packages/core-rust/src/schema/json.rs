//! JSON schema parsing, define comparison, and value checking.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use super::SchemaParts;
use crate::error::{SchemaError, SchemaResult};
use crate::limits::{
    KEYWORD_MODE_COMPATIBLE, KEYWORD_MODE_STRICT, KEYWORD_SCHEMA_DEFINE, KEYWORD_SCHEMA_INDEXES,
    KEYWORD_SCHEMA_MODE, KEYWORD_SCHEMA_SKIPSIZE, KEYWORD_SCHEMA_VERSION,
    SCHEMA_FIELD_NAME_COUNT_MAX, SCHEMA_FIELD_PATH_DEPTH_MAX, SCHEMA_INDEX_COUNT_MAX,
    SCHEMA_META_FIELD_COUNT_MAX, SCHEMA_META_FIELD_COUNT_MIN, SCHEMA_SKIPSIZE_MAX,
    SCHEMA_SUPPORT_VERSION,
};
use crate::types::{
    DefineLevel, FieldPath, FieldType, FieldValue, SchemaAttribute, SchemaCompareResult,
    SchemaDefine, SchemaMode,
};
use crate::utils;
use crate::value::ValueObject;

fn meta(keyword: &str) -> FieldPath {
    FieldPath::new([keyword])
}

/// Parses a JSON schema into its parts and canonical text.
pub(super) fn parse(input: &[u8]) -> SchemaResult<(SchemaParts, String)> {
    if input.is_empty() {
        return Err(SchemaError::JsonParseFail("empty schema".into()));
    }
    let doc = ValueObject::parse(input, 0)?;
    check_meta_fields(&doc)?;

    let mut parts = SchemaParts {
        mode: parse_version_and_mode(&doc)?,
        ..SchemaParts::default()
    };
    parts.define = parse_define(&doc)?;
    parse_indexes(&doc, &mut parts)?;
    parts.skip_size = parse_skip_size(&doc)?;
    Ok((parts, doc.to_json_string()))
}

fn check_meta_fields(doc: &ValueObject) -> SchemaResult<()> {
    let metas = doc.sub_field_types([&FieldPath::root()])?;
    if !(SCHEMA_META_FIELD_COUNT_MIN..=SCHEMA_META_FIELD_COUNT_MAX).contains(&metas.len()) {
        warn!(count = metas.len(), "unexpected meta field count");
        return Err(SchemaError::parse(format!("{} meta fields", metas.len())));
    }
    let expect = |keyword: &str, expected: FieldType, required: bool| -> SchemaResult<usize> {
        match metas.get(&meta(keyword)) {
            Some(actual) if *actual == expected => Ok(1),
            Some(actual) => {
                warn!(keyword, %expected, %actual, "meta field has wrong type");
                Err(SchemaError::parse(format!("{keyword} must be {expected}")))
            }
            None if required => {
                warn!(keyword, "meta field missing");
                Err(SchemaError::parse(format!("{keyword} missing")))
            }
            None => Ok(0),
        }
    };
    expect(KEYWORD_SCHEMA_VERSION, FieldType::String, true)?;
    expect(KEYWORD_SCHEMA_MODE, FieldType::String, true)?;
    // An empty define is a LeafObject and is rejected here.
    expect(KEYWORD_SCHEMA_DEFINE, FieldType::InternalObject, true)?;
    let optional = expect(KEYWORD_SCHEMA_INDEXES, FieldType::Array, false)?
        + expect(KEYWORD_SCHEMA_SKIPSIZE, FieldType::Integer, false)?;
    if metas.len() != SCHEMA_META_FIELD_COUNT_MIN + optional {
        warn!(count = metas.len(), "unrecognized meta field");
        return Err(SchemaError::parse("unrecognized meta field"));
    }
    Ok(())
}

fn string_meta(doc: &ValueObject, keyword: &str) -> SchemaResult<String> {
    match doc.field_value(&meta(keyword))? {
        FieldValue::String(s) => Ok(s),
        other => Err(SchemaError::internal(format!("{keyword} read as {other:?}"))),
    }
}

fn parse_version_and_mode(doc: &ValueObject) -> SchemaResult<SchemaMode> {
    let version = string_meta(doc, KEYWORD_SCHEMA_VERSION)?;
    if utils::strip(&version) != SCHEMA_SUPPORT_VERSION {
        warn!(%version, "unsupported schema version");
        return Err(SchemaError::parse(format!("unsupported version {version:?}")));
    }
    let mode = string_meta(doc, KEYWORD_SCHEMA_MODE)?;
    match utils::strip(&mode) {
        KEYWORD_MODE_STRICT => Ok(SchemaMode::Strict),
        KEYWORD_MODE_COMPATIBLE => Ok(SchemaMode::Compatible),
        _ => {
            warn!(%mode, "unsupported schema mode");
            Err(SchemaError::parse(format!("unsupported mode {mode:?}")))
        }
    }
}

fn define_item_attribute(
    doc: &ValueObject,
    path: &FieldPath,
    field_type: FieldType,
) -> SchemaResult<SchemaAttribute> {
    let name = path.last().unwrap_or_default();
    utils::check_field_name(name)?;
    match field_type {
        FieldType::String => {
            let FieldValue::String(text) = doc.field_value(path)? else {
                return Err(SchemaError::internal("string attribute not readable"));
            };
            let mut attr = utils::parse_and_check_schema_attribute(&text)?;
            attr.is_indexable = true;
            Ok(attr)
        }
        FieldType::Array => {
            let len = doc.array_len(path)?;
            if len != 0 {
                return Err(SchemaError::parse(format!("array define of {len} items")));
            }
            Ok(SchemaAttribute::structural(field_type))
        }
        FieldType::LeafObject | FieldType::InternalObject => {
            Ok(SchemaAttribute::structural(field_type))
        }
        other => Err(SchemaError::parse(format!("define item of type {other}"))),
    }
}

/// Walks the define tree breadth first, one depth per round.
fn parse_define(doc: &ValueObject) -> SchemaResult<SchemaDefine> {
    let mut define = SchemaDefine::default();
    let mut nest = vec![meta(KEYWORD_SCHEMA_DEFINE)];
    let mut name_count = 0usize;
    for depth in 0..SCHEMA_FIELD_PATH_DEPTH_MAX {
        let items = doc.sub_field_types(&nest)?;
        name_count += items.len();
        nest.clear();
        for (path, field_type) in items {
            let attr = define_item_attribute(doc, &path, field_type).map_err(|e| {
                warn!(%path, depth, error = %e, "invalid define item");
                SchemaError::parse(format!("define item {path}: {e}"))
            })?;
            define.insert(path.without_first(), attr);
            if field_type == FieldType::InternalObject {
                if depth == SCHEMA_FIELD_PATH_DEPTH_MAX - 1 {
                    warn!(%path, "nested object at depth limit");
                    return Err(SchemaError::parse(format!("{path} nests too deep")));
                }
                nest.push(path);
            }
        }
        if nest.is_empty() {
            break;
        }
    }
    if name_count > SCHEMA_FIELD_NAME_COUNT_MAX {
        warn!(name_count, "too many define fields");
        return Err(SchemaError::parse(format!("{name_count} define fields")));
    }
    Ok(define)
}

fn parse_indexes(doc: &ValueObject, parts: &mut SchemaParts) -> SchemaResult<()> {
    let path = meta(KEYWORD_SCHEMA_INDEXES);
    if !doc.is_field_path_exist(&path) {
        return Ok(());
    }
    let groups = doc.string_or_string_array(&path).map_err(|e| {
        warn!(error = %e, "malformed index list");
        SchemaError::parse(format!("index list: {e}"))
    })?;
    if groups.len() > SCHEMA_INDEX_COUNT_MAX {
        warn!(count = groups.len(), "too many indexes");
        return Err(SchemaError::parse(format!("{} indexes", groups.len())));
    }
    for group in &groups {
        parts.add_index(group)?;
    }
    Ok(())
}

fn parse_skip_size(doc: &ValueObject) -> SchemaResult<u32> {
    let path = meta(KEYWORD_SCHEMA_SKIPSIZE);
    if !doc.is_field_path_exist(&path) {
        return Ok(0);
    }
    let FieldValue::Integer(raw) = doc.field_value(&path)? else {
        return Err(SchemaError::internal("skip size not an integer"));
    };
    match u32::try_from(raw) {
        Ok(size) if size <= SCHEMA_SKIPSIZE_MAX => Ok(size),
        _ => {
            warn!(skip_size = raw, "skip size out of range");
            Err(SchemaError::parse(format!("skip size {raw} out of range")))
        }
    }
}

// ---------------------------------------------------------------------------
// Define comparison
// ---------------------------------------------------------------------------

fn attributes_compatible(old: &SchemaAttribute, new: &SchemaAttribute) -> bool {
    if old.field_type != new.field_type
        && !(old.field_type == FieldType::LeafObject && new.field_type == FieldType::InternalObject)
    {
        return false;
    }
    if !old.is_indexable {
        return true;
    }
    if old.not_null != new.not_null || old.has_default_value() != new.has_default_value() {
        return false;
    }
    match (&old.default_value, &new.default_value) {
        (Some(a), Some(b)) => a.binary_eq(b),
        _ => true,
    }
}

fn compare_level(old: &DefineLevel, new: &DefineLevel) -> bool {
    for (path, old_attr) in old {
        let Some(new_attr) = new.get(path) else {
            warn!(%path, "field missing from new schema");
            return false;
        };
        if !attributes_compatible(old_attr, new_attr) {
            warn!(%path, "field attribute changed");
            return false;
        }
    }
    for (path, attr) in new {
        if !old.contains_key(path) && attr.not_null && !attr.has_default_value() {
            warn!(%path, "added field is NOT NULL without default");
            return false;
        }
    }
    true
}

/// Compares define trees depth by depth; `mode` is the older schema's mode.
pub(super) fn compare_define(
    mode: SchemaMode,
    old: &SchemaDefine,
    new: &SchemaDefine,
) -> SchemaCompareResult {
    let empty = DefineLevel::new();
    let mut exact = true;
    for depth in 0..SCHEMA_FIELD_PATH_DEPTH_MAX {
        let old_level = old.level(depth).unwrap_or(&empty);
        let new_level = new.level(depth).unwrap_or(&empty);
        if old_level.is_empty() && new_level.is_empty() {
            break;
        }
        if new_level.len() < old_level.len() {
            warn!(depth, old = old_level.len(), new = new_level.len(), "new schema has fewer fields");
            return SchemaCompareResult::UnequalIncompatible;
        }
        if new_level.len() > old_level.len() {
            if mode == SchemaMode::Strict {
                warn!(depth, "strict schema cannot gain fields");
                return SchemaCompareResult::UnequalIncompatible;
            }
            exact = false;
        }
        if !compare_level(old_level, new_level) {
            return SchemaCompareResult::UnequalIncompatible;
        }
    }
    if exact {
        SchemaCompareResult::EqualExactly
    } else {
        SchemaCompareResult::UnequalCompatibleUpgrade
    }
}

// ---------------------------------------------------------------------------
// Value checking
// ---------------------------------------------------------------------------

fn check_numeric(value_type: FieldType, schema_type: FieldType) -> bool {
    match value_type {
        FieldType::Double => schema_type == FieldType::Double,
        FieldType::Long => matches!(schema_type, FieldType::Long | FieldType::Double),
        _ => matches!(
            schema_type,
            FieldType::Integer | FieldType::Long | FieldType::Double
        ),
    }
}

fn check_item(path: &FieldPath, attr: &SchemaAttribute, value_type: FieldType) -> SchemaResult<()> {
    let schema_type = attr.field_type;
    if schema_type == FieldType::Null {
        return Err(SchemaError::internal(format!("{path} declared NULL")));
    }
    let type_mismatch = || {
        SchemaError::ValueMismatchFieldType(format!("{path}: {value_type} against {schema_type}"))
    };
    match value_type {
        FieldType::Null if attr.not_null => Err(SchemaError::ValueMismatchConstraint(format!(
            "{path} is NOT NULL"
        ))),
        FieldType::Null => Ok(()),
        FieldType::Bool | FieldType::String | FieldType::Array => {
            if value_type == schema_type {
                Ok(())
            } else {
                Err(type_mismatch())
            }
        }
        // Missing or extra sub-fields are judged at the next depth.
        FieldType::LeafObject | FieldType::InternalObject => {
            if schema_type.is_object() {
                Ok(())
            } else {
                Err(type_mismatch())
            }
        }
        _ => {
            if check_numeric(value_type, schema_type) {
                Ok(())
            } else {
                Err(type_mismatch())
            }
        }
    }
}

/// Checks `value` against the define and returns the declared paths that
/// are absent but permitted to be.
pub(super) fn check_value(
    parts: &SchemaParts,
    value: &ValueObject,
) -> SchemaResult<BTreeSet<FieldPath>> {
    let mut lacking = BTreeSet::new();
    let mut nest = vec![FieldPath::root()];
    for depth in 0..SCHEMA_FIELD_PATH_DEPTH_MAX {
        let Some(level) = parts.define.level(depth) else {
            break;
        };
        let present: BTreeMap<FieldPath, FieldType> = value
            .sub_field_types(&nest)
            .map_err(|e| SchemaError::ValueMismatchFieldType(format!("depth {depth}: {e}")))?;
        nest.clear();

        if parts.mode == SchemaMode::Strict && present.len() > level.len() {
            return Err(SchemaError::ValueMismatchFieldCount(format!(
                "{} fields at depth {depth}, schema declares {}",
                present.len(),
                level.len()
            )));
        }
        for (path, attr) in level {
            if attr.field_type == FieldType::InternalObject {
                nest.push(path.clone());
            }
            match present.get(path) {
                Some(value_type) => check_item(path, attr, *value_type)?,
                None if attr.not_null && !attr.has_default_value() => {
                    return Err(SchemaError::ValueMismatchConstraint(format!(
                        "{path} is NOT NULL and has no default"
                    )));
                }
                None => {
                    lacking.insert(path.clone());
                }
            }
        }
    }
    Ok(lacking)
}
