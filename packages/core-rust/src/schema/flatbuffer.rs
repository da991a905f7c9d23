//! FlatBuffer schema parsing and comparison over decoded reflection data,
//! plus verification and root-field extraction for value buffers.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use flatbuffers::VerifierOptions;

use super::SchemaParts;
use crate::bfbs::access::{Access, SIZE_PREFIX_LEN};
use crate::bfbs::{BaseType, ReflectionField, ReflectionObject, ReflectionSchema};
use crate::error::{SchemaError, SchemaResult};
use crate::limits::{
    KEYWORD_INDEX, KEYWORD_SCHEMA_SKIPSIZE, KEYWORD_SCHEMA_VERSION, SCHEMA_FIELD_NAME_COUNT_MAX,
    SCHEMA_FIELD_PATH_DEPTH_MAX, SCHEMA_INDEX_COUNT_MAX, SCHEMA_SKIPSIZE_MAX,
    SCHEMA_SUPPORT_VERSION,
};
use crate::types::{FieldPath, FieldType, FieldValue, SchemaAttribute, SchemaCompareResult};
use crate::utils;

const NEARLY_EQUAL_EPSILON: f64 = 0.000_001;

fn nearly_equal(left: f64, right: f64) -> bool {
    let diff = (left - right).abs();
    if diff < NEARLY_EQUAL_EPSILON {
        return true;
    }
    let bigger = left.abs().max(right.abs());
    bigger != 0.0 && diff / bigger < NEARLY_EQUAL_EPSILON
}

fn map_field_type(base: BaseType) -> FieldType {
    match base {
        BaseType::Bool => FieldType::Bool,
        BaseType::Byte | BaseType::UByte | BaseType::Short | BaseType::UShort | BaseType::Int => {
            FieldType::Integer
        }
        BaseType::UInt | BaseType::Long => FieldType::Long,
        BaseType::ULong | BaseType::Float | BaseType::Double => FieldType::Double,
        BaseType::String => FieldType::String,
        BaseType::Vector => FieldType::Array,
        BaseType::Obj => FieldType::InternalObject,
        _ => FieldType::Null,
    }
}

fn non_empty_attr<'a>(attrs: &'a BTreeMap<String, Option<String>>, key: &str) -> Option<&'a str> {
    attrs
        .get(key)
        .and_then(Option::as_deref)
        .filter(|v| !v.is_empty())
}

/// Accumulates define, raw index declarations, and the description while
/// walking the root table.
struct DefineParser<'s> {
    schema: &'s ReflectionSchema,
    parts: SchemaParts,
    description: String,
    /// Root field name to the raw `INDEX` attribute value.
    raw_indexes: BTreeMap<String, String>,
}

impl<'s> DefineParser<'s> {
    fn new(schema: &'s ReflectionSchema) -> Self {
        Self {
            schema,
            parts: SchemaParts::default(),
            description: String::new(),
            raw_indexes: BTreeMap::new(),
        }
    }

    fn parse_root_attributes(&mut self, root: &ReflectionObject) -> SchemaResult<()> {
        let Some(version) = non_empty_attr(&root.attributes, KEYWORD_SCHEMA_VERSION) else {
            warn!("root table lacks SCHEMA_VERSION");
            return Err(SchemaError::parse("no SCHEMA_VERSION attribute"));
        };
        if utils::strip(version) != SCHEMA_SUPPORT_VERSION {
            warn!(version, "unsupported schema version");
            return Err(SchemaError::parse(format!("unsupported version {version:?}")));
        }
        self.description
            .push_str(&format!("{KEYWORD_SCHEMA_VERSION}={SCHEMA_SUPPORT_VERSION};"));

        let Some(raw) = non_empty_attr(&root.attributes, KEYWORD_SCHEMA_SKIPSIZE) else {
            debug!("no SCHEMA_SKIPSIZE attribute, using 0");
            return Ok(());
        };
        let text = utils::strip(raw);
        // Only the canonical decimal form is accepted: no sign, no leading zeros.
        let skip_size = utils::parse_integer_round_trip(text)
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n <= SCHEMA_SKIPSIZE_MAX && n.to_string() == text)
            .ok_or_else(|| {
                warn!(skip_size = raw, "invalid SCHEMA_SKIPSIZE");
                SchemaError::parse(format!("invalid skip size {raw:?}"))
            })?;
        self.parts.skip_size = skip_size;
        self.description
            .push_str(&format!("{KEYWORD_SCHEMA_SKIPSIZE}={text};"));
        Ok(())
    }

    fn parse_root_define(&mut self, root: &ReflectionObject) -> SchemaResult<()> {
        if root.fields.is_empty() {
            warn!("root table has no fields");
            return Err(SchemaError::parse("empty define"));
        }
        for field in &root.fields {
            let path = FieldPath::new([field.name.as_str()]);
            self.parse_field(field, path)?;
        }
        let count = self.parts.define.field_count();
        if count > SCHEMA_FIELD_NAME_COUNT_MAX {
            warn!(count, "too many define fields");
            return Err(SchemaError::parse(format!("{count} define fields")));
        }
        Ok(())
    }

    fn check_type_support(field: &ReflectionField, is_root: bool) -> SchemaResult<()> {
        let ty = &field.field_type;
        let base = ty.base_type;
        let supported = if is_root {
            (base.is_indexable() || base == BaseType::Vector || base == BaseType::Obj)
                && !(base.is_integer() && ty.index >= 0)
                && (base != BaseType::Vector || ty.element.is_indexable())
        } else {
            base.is_scalar() || base == BaseType::Obj
        };
        if supported {
            Ok(())
        } else {
            warn!(field = %field.name, %base, element = %ty.element, is_root, "unsupported field type");
            Err(SchemaError::parse(format!(
                "field {} of type {base} not supported",
                field.name
            )))
        }
    }

    fn parse_field(&mut self, field: &ReflectionField, path: FieldPath) -> SchemaResult<()> {
        utils::check_field_name(&field.name).map_err(|e| {
            warn!(field = %field.name, error = %e, "invalid field name");
            SchemaError::parse(format!("invalid field name {:?}", field.name))
        })?;
        if path.is_empty() || path.len() > SCHEMA_FIELD_PATH_DEPTH_MAX {
            return Err(SchemaError::parse(format!("{path} exceeds depth limit")));
        }
        let is_root = path.len() == 1;
        Self::check_type_support(field, is_root)?;

        let base = field.field_type.base_type;
        let attr = SchemaAttribute {
            is_indexable: base.is_indexable() && is_root,
            ..SchemaAttribute::structural(map_field_type(base))
        };
        self.description.push_str(&format!("{path}={base};"));
        if base.is_offset_type() && field.deprecated && field.required {
            warn!(%path, "field both deprecated and required");
            return Err(SchemaError::parse(format!("{path} deprecated and required")));
        }
        if attr.is_indexable {
            if let Some(raw) = field.attributes.get(KEYWORD_INDEX) {
                self.raw_indexes
                    .insert(field.name.clone(), raw.clone().unwrap_or_default());
            }
        }
        if !self.parts.define.insert(path.clone(), attr) {
            warn!(%path, "field declared twice");
            return Err(SchemaError::parse(format!("{path} declared twice")));
        }
        if base == BaseType::Obj {
            self.parse_struct(field, &path)?;
        }
        Ok(())
    }

    fn parse_struct(&mut self, field: &ReflectionField, path: &FieldPath) -> SchemaResult<()> {
        if path.len() >= SCHEMA_FIELD_PATH_DEPTH_MAX {
            warn!(%path, "struct at depth limit");
            return Err(SchemaError::parse(format!("{path} nests too deep")));
        }
        let object = self
            .schema
            .object_at(field.field_type.index)
            .ok_or_else(|| SchemaError::internal(format!("{path} references no object")))?;
        if !object.is_struct {
            warn!(table = %object.name, "nested table not supported");
            return Err(SchemaError::parse(format!("nested table {} not supported", object.name)));
        }
        self.description.push_str(&format!(
            "StructName={};",
            utils::strip_name_space(&object.name)
        ));
        for sub in &object.fields {
            self.parse_field(sub, path.child(&sub.name))?;
        }
        Ok(())
    }

    fn parse_indexes(&mut self) -> SchemaResult<()> {
        for (name, raw) in &self.raw_indexes {
            let mut group = vec![name.clone()];
            let raw = raw.as_str();
            if !raw.is_empty() && raw != "0" {
                group.extend(
                    raw.split(',')
                        .map(utils::strip)
                        .filter(|piece| !piece.is_empty())
                        .map(str::to_string),
                );
            }
            self.parts.add_index(&group).inspect_err(|e| {
                warn!(index = %name, raw, error = %e, "invalid index declaration");
            })?;
            self.description.push_str(&format!("{KEYWORD_INDEX}={name};"));
        }
        let count = self.parts.indexes.len();
        if count > SCHEMA_INDEX_COUNT_MAX {
            warn!(count, "too many indexes");
            return Err(SchemaError::parse(format!("{count} indexes")));
        }
        Ok(())
    }
}

/// Parses a verified schema binary into parts, reflection data, and the
/// description string.
pub(super) fn parse(raw: &[u8]) -> SchemaResult<(SchemaParts, ReflectionSchema, String)> {
    let reflection = ReflectionSchema::decode_size_prefixed(raw)?;
    let root = match &reflection.root_table {
        Some(root) if !root.is_struct => root.clone(),
        _ => {
            warn!("schema has no root table");
            return Err(SchemaError::parse("root table missing or a struct"));
        }
    };
    let mut parser = DefineParser::new(&reflection);
    parser.description = format!("RootTableName={};", utils::strip_name_space(&root.name));
    parser.parse_root_attributes(&root)?;
    parser.parse_root_define(&root)?;
    parser.parse_indexes()?;
    let DefineParser {
        parts, description, ..
    } = parser;
    debug!(%description, "flatbuffer define parsed");
    Ok((parts, reflection, description))
}

// ---------------------------------------------------------------------------
// Define comparison
// ---------------------------------------------------------------------------

struct DefineComparer<'s> {
    old: &'s ReflectionSchema,
    new: &'s ReflectionSchema,
    /// Struct type names already compared.
    visited: BTreeSet<String>,
}

impl DefineComparer<'_> {
    fn compare_field(old: &ReflectionField, new: &ReflectionField) -> bool {
        let (old_ty, new_ty) = (&old.field_type, &new.field_type);
        if old_ty.base_type != new_ty.base_type {
            warn!(field = %old.name, old = %old_ty.base_type, new = %new_ty.base_type, "base type differs");
            return false;
        }
        if old_ty.base_type == BaseType::Vector && old_ty.element != new_ty.element {
            warn!(field = %old.name, "vector element type differs");
            return false;
        }
        if old.offset != new.offset {
            warn!(field = %old.name, old = old.offset, new = new.offset, "offset differs");
            return false;
        }
        if old.default_integer != new.default_integer
            || !nearly_equal(old.default_real, new.default_real)
        {
            warn!(field = %old.name, "default value differs");
            return false;
        }
        if old_ty.base_type.is_offset_type() && old.required != new.required {
            warn!(field = %old.name, "required flag differs");
            return false;
        }
        true
    }

    fn compare_object(
        &mut self,
        old: &ReflectionObject,
        new: &ReflectionObject,
        is_root: bool,
    ) -> SchemaResult<SchemaCompareResult> {
        use SchemaCompareResult::{EqualExactly, UnequalCompatibleUpgrade, UnequalIncompatible};

        let (old_count, new_count) = (old.fields.len(), new.fields.len());
        if (is_root && new_count < old_count) || (!is_root && new_count != old_count) {
            warn!(object = %old.name, old_count, new_count, "field count not compatible");
            return Ok(UnequalIncompatible);
        }
        for old_field in &old.fields {
            let Some(new_field) = new.field(&old_field.name) else {
                warn!(field = %old_field.name, "field missing from new schema");
                return Ok(UnequalIncompatible);
            };
            if !Self::compare_field(old_field, new_field) {
                return Ok(UnequalIncompatible);
            }
            if old_field.field_type.base_type == BaseType::Obj
                && self.compare_struct(old_field, new_field)? == UnequalIncompatible
            {
                return Ok(UnequalIncompatible);
            }
        }
        if old_count == new_count {
            return Ok(EqualExactly);
        }
        let required_extra = new
            .fields
            .iter()
            .find(|f| old.field(&f.name).is_none() && f.required);
        if let Some(extra) = required_extra {
            warn!(field = %extra.name, "added field is required");
            return Ok(UnequalIncompatible);
        }
        Ok(UnequalCompatibleUpgrade)
    }

    fn compare_struct(
        &mut self,
        old_field: &ReflectionField,
        new_field: &ReflectionField,
    ) -> SchemaResult<SchemaCompareResult> {
        let old = self
            .old
            .object_at(old_field.field_type.index)
            .ok_or_else(|| SchemaError::internal("struct index out of range"))?;
        let new = self
            .new
            .object_at(new_field.field_type.index)
            .ok_or_else(|| SchemaError::internal("struct index out of range"))?;
        let name = utils::strip_name_space(&old.name);
        if name != utils::strip_name_space(&new.name) {
            warn!(old = %old.name, new = %new.name, "struct type differs");
            return Ok(SchemaCompareResult::UnequalIncompatible);
        }
        if !self.visited.insert(name.to_string()) {
            return Ok(SchemaCompareResult::EqualExactly);
        }
        if old.minalign != new.minalign || old.bytesize != new.bytesize {
            warn!(name, "struct layout differs");
            return Ok(SchemaCompareResult::UnequalIncompatible);
        }
        self.compare_object(old, new, false)
    }
}

/// Compares the root tables of two parsed schemas, `old` as the baseline.
pub(super) fn compare_define(
    old: &ReflectionSchema,
    new: &ReflectionSchema,
) -> SchemaResult<SchemaCompareResult> {
    let (Some(old_root), Some(new_root)) = (&old.root_table, &new.root_table) else {
        return Err(SchemaError::internal("parsed schema without root table"));
    };
    if utils::strip_name_space(&old_root.name) != utils::strip_name_space(&new_root.name) {
        warn!(old = %old_root.name, new = %new_root.name, "root table name differs");
        return Ok(SchemaCompareResult::UnequalIncompatible);
    }
    let mut comparer = DefineComparer {
        old,
        new,
        visited: BTreeSet::new(),
    };
    comparer.compare_object(old_root, new_root, true)
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Rejects a value whose size prefix does not cover exactly the rest of it.
fn check_size_prefix(body: &[u8]) -> SchemaResult<()> {
    let declared = body
        .get(..SIZE_PREFIX_LEN)
        .filter(|_| body.len() > SIZE_PREFIX_LEN)
        .and_then(|prefix| prefix.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| {
            SchemaError::InvalidArgs(format!("value of {} bytes has no payload", body.len()))
        })?;
    if usize::try_from(declared).ok() != Some(body.len() - SIZE_PREFIX_LEN) {
        return Err(SchemaError::InvalidArgs(format!(
            "size prefix {declared} does not match value of {} bytes",
            body.len()
        )));
    }
    Ok(())
}

fn root_table(reflection: &ReflectionSchema) -> SchemaResult<&ReflectionObject> {
    reflection
        .root_table
        .as_ref()
        .ok_or_else(|| SchemaError::internal("parsed schema without root table"))
}

/// Verifies a size-prefixed value against the root table. Positions and
/// alignment are relative to the start of `body`.
pub(super) fn verify_value(reflection: &ReflectionSchema, body: &[u8]) -> SchemaResult<()> {
    check_size_prefix(body)?;
    reflection.verify_root(body, root_table(reflection)?)
}

/// Reads the root field named by `$.<name>` from a size-prefixed value.
pub(super) fn extract_value(
    reflection: &ReflectionSchema,
    path: &str,
    body: &[u8],
) -> SchemaResult<FieldValue> {
    check_size_prefix(body)?;
    let name = path
        .strip_prefix("$.")
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| SchemaError::InvalidArgs(format!("path {path:?} lacks a field name")))?;
    let field = root_table(reflection)?
        .field(name)
        .ok_or_else(|| SchemaError::internal(format!("no root field named {name}")))?;
    let base = field.field_type.base_type;
    if !base.is_indexable() {
        return Err(SchemaError::NotSupport(format!("field {name} of type {base} not indexable")));
    }

    let opts = VerifierOptions::default();
    let mut access = Access::new(&opts, body);
    let root = access.size_prefixed_root()?;
    let Some(pos) = access.field(root, field.offset)? else {
        return Ok(match base {
            BaseType::String => FieldValue::String(String::new()),
            _ => default_of(field),
        });
    };
    if base == BaseType::String {
        let target = access.follow(pos)?;
        return Ok(FieldValue::String(access.string(target)?.to_string()));
    }
    read_scalar(&mut access, pos, base)
}

#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn default_of(field: &ReflectionField) -> FieldValue {
    let int = field.default_integer;
    match field.field_type.base_type {
        BaseType::Bool => FieldValue::Bool(int != 0),
        BaseType::UInt | BaseType::Long => FieldValue::Long(int),
        // Defaults of sub-i32 types always fit.
        BaseType::Byte | BaseType::UByte | BaseType::Short | BaseType::UShort | BaseType::Int => {
            FieldValue::Integer(i32::try_from(int).unwrap_or_default())
        }
        BaseType::ULong => FieldValue::Double(int as u64 as f64),
        _ => FieldValue::Double(field.default_real),
    }
}

#[allow(clippy::cast_precision_loss)]
fn read_scalar(access: &mut Access<'_, '_>, pos: usize, base: BaseType) -> SchemaResult<FieldValue> {
    Ok(match base {
        BaseType::Bool => FieldValue::Bool(access.scalar::<u8>(pos)? != 0),
        BaseType::Byte => FieldValue::Integer(i32::from(access.scalar::<i8>(pos)?)),
        BaseType::UByte => FieldValue::Integer(i32::from(access.scalar::<u8>(pos)?)),
        BaseType::Short => FieldValue::Integer(i32::from(access.scalar::<i16>(pos)?)),
        BaseType::UShort => FieldValue::Integer(i32::from(access.scalar::<u16>(pos)?)),
        BaseType::Int => FieldValue::Integer(access.scalar::<i32>(pos)?),
        BaseType::UInt => FieldValue::Long(i64::from(access.scalar::<u32>(pos)?)),
        BaseType::Long => FieldValue::Long(access.scalar::<i64>(pos)?),
        BaseType::ULong => FieldValue::Double(access.scalar::<u64>(pos)? as f64),
        BaseType::Float => FieldValue::Double(f64::from(access.scalar::<f32>(pos)?)),
        BaseType::Double => FieldValue::Double(access.scalar::<f64>(pos)?),
        other => {
            return Err(SchemaError::NotSupport(format!("cannot extract {other}")));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bfbs::testkit::{build_value, FieldSpec, ObjectSpec, SchemaSpec, ValueEntry};

    #[test]
    fn nearly_equal_tolerates_text_round_trip() {
        assert!(nearly_equal(0.1, 0.100_000_000_1));
        assert!(nearly_equal(1e10, 1e10 + 1.0));
        assert!(!nearly_equal(1.0, 1.1));
        assert!(nearly_equal(0.0, 0.0));
    }

    #[test]
    fn base_types_map_to_field_types() {
        assert_eq!(map_field_type(BaseType::UByte), FieldType::Integer);
        assert_eq!(map_field_type(BaseType::UInt), FieldType::Long);
        assert_eq!(map_field_type(BaseType::ULong), FieldType::Double);
        assert_eq!(map_field_type(BaseType::Union), FieldType::Null);
    }

    fn skip_size_schema(skip: &str) -> Vec<u8> {
        SchemaSpec::new(
            ObjectSpec::versioned_root("Root")
                .attr("SCHEMA_SKIPSIZE", Some(skip))
                .field(FieldSpec::scalar("n", BaseType::Int, 0)),
        )
        .build()
    }

    #[test]
    fn skip_size_must_be_canonical_decimal() {
        let (parts, _, description) = parse(&skip_size_schema(" 5 ")).unwrap();
        assert_eq!(parts.skip_size, 5);
        assert!(description.contains("SCHEMA_SKIPSIZE=5;"));
        assert_eq!(parse(&skip_size_schema("0")).unwrap().0.skip_size, 0);
        for bad in ["+5", "-0", "05", "5.0", "4194303"] {
            assert!(
                matches!(parse(&skip_size_schema(bad)), Err(SchemaError::SchemaParseFail(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn size_prefix_must_match() {
        assert!(matches!(check_size_prefix(&[1, 0, 0, 0]), Err(SchemaError::InvalidArgs(_))));
        assert!(matches!(check_size_prefix(&[9, 0, 0, 0, 1]), Err(SchemaError::InvalidArgs(_))));
        assert!(check_size_prefix(&[1, 0, 0, 0, 7]).is_ok());
    }

    fn int_root() -> ReflectionSchema {
        let bytes = SchemaSpec::new(
            ObjectSpec::versioned_root("Root").field(FieldSpec::scalar("n", BaseType::Int, 0)),
        )
        .build();
        ReflectionSchema::decode_size_prefixed(&bytes).unwrap()
    }

    /// Root table at 16 with its vtable at 8 and one i32 field at `at`.
    fn hand_built_value(at: u8) -> Vec<u8> {
        let mut body = vec![0u8; 28];
        body[..4].copy_from_slice(&24u32.to_le_bytes());
        body[4..8].copy_from_slice(&12u32.to_le_bytes());
        body[8..14].copy_from_slice(&[6, 0, 12, 0, at - 16, 0]);
        body[16..20].copy_from_slice(&8i32.to_le_bytes());
        let at = usize::from(at);
        body[at..at + 4].copy_from_slice(&7i32.to_le_bytes());
        body
    }

    #[test]
    fn aligned_int_is_accepted_and_read() {
        let schema = int_root();
        let body = hand_built_value(20);
        verify_value(&schema, &body).unwrap();
        assert_eq!(extract_value(&schema, "$.n", &body).unwrap(), FieldValue::Integer(7));
    }

    #[test]
    fn misaligned_int_is_rejected() {
        let schema = int_root();
        let body = hand_built_value(21);
        let err = verify_value(&schema, &body).unwrap_err();
        assert!(matches!(&err, SchemaError::FlatBufferVerifyFail(msg) if msg.contains("nalign")));
        assert!(matches!(
            extract_value(&schema, "$.n", &body),
            Err(SchemaError::FlatBufferVerifyFail(_))
        ));
    }

    #[test]
    fn built_values_verify_and_extract() {
        let bytes = SchemaSpec::new(
            ObjectSpec::versioned_root("Root")
                .field(FieldSpec::scalar("id", BaseType::Long, 0))
                .field(FieldSpec::scalar("name", BaseType::String, 1))
                .field(FieldSpec::vector("tags", BaseType::Int, 2))
                .field(FieldSpec::scalar("flag", BaseType::Bool, 3).default_integer(1)),
        )
        .build();
        let schema = ReflectionSchema::decode_size_prefixed(&bytes).unwrap();
        let body = build_value(&[
            (0, ValueEntry::Long(-3)),
            (1, ValueEntry::Str("abc".into())),
            (2, ValueEntry::Ints(vec![1, 2])),
        ]);
        verify_value(&schema, &body).unwrap();
        assert_eq!(extract_value(&schema, "$.id", &body).unwrap(), FieldValue::Long(-3));
        assert_eq!(
            extract_value(&schema, "$.name", &body).unwrap(),
            FieldValue::String("abc".into())
        );
        assert_eq!(extract_value(&schema, "$.flag", &body).unwrap(), FieldValue::Bool(true));
        assert!(matches!(
            extract_value(&schema, "$.tags", &body),
            Err(SchemaError::NotSupport(_))
        ));
    }

    #[test]
    fn missing_required_string_fails_verification() {
        let bytes = SchemaSpec::new(
            ObjectSpec::versioned_root("Root")
                .field(FieldSpec::scalar("id", BaseType::Int, 0))
                .field(FieldSpec::scalar("name", BaseType::String, 1).required()),
        )
        .build();
        let schema = ReflectionSchema::decode_size_prefixed(&bytes).unwrap();
        let body = build_value(&[(0, ValueEntry::Int(1))]);
        assert!(matches!(
            verify_value(&schema, &body),
            Err(SchemaError::FlatBufferVerifyFail(_))
        ));
    }
}
