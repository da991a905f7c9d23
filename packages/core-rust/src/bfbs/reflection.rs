//! Decoder for binary FlatBuffer schemas (`.bfbs`, the `reflection.fbs`
//! format) and reflection-driven verification of value buffers.
//!
//! The schema binary is decoded once into owned structures. Value buffers
//! are then walked by [`flatbuffers::TableVerifier`] using the field types
//! those structures describe.

use std::collections::BTreeMap;

use flatbuffers::{
    buffer_has_identifier, ForwardsUOffset, TableVerifier, Vector, VerifierOptions,
};
use tracing::debug;

use super::access::{Access, Scalar, SIZE_PREFIX_LEN};
use crate::error::{SchemaError, SchemaResult};

pub const SCHEMA_FILE_IDENTIFIER: &str = "BFBS";

/// Base types of the reflection schema, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BaseType {
    None,
    UType,
    Bool,
    Byte,
    UByte,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
    String,
    Vector,
    Obj,
    Union,
    Array,
    Vector64,
}

impl BaseType {
    #[must_use]
    pub fn from_i8(raw: i8) -> Option<Self> {
        const ALL: [BaseType; 19] = [
            BaseType::None,
            BaseType::UType,
            BaseType::Bool,
            BaseType::Byte,
            BaseType::UByte,
            BaseType::Short,
            BaseType::UShort,
            BaseType::Int,
            BaseType::UInt,
            BaseType::Long,
            BaseType::ULong,
            BaseType::Float,
            BaseType::Double,
            BaseType::String,
            BaseType::Vector,
            BaseType::Obj,
            BaseType::Union,
            BaseType::Array,
            BaseType::Vector64,
        ];
        usize::try_from(raw).ok().and_then(|i| ALL.get(i).copied())
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::UType => "UType",
            Self::Bool => "Bool",
            Self::Byte => "Byte",
            Self::UByte => "UByte",
            Self::Short => "Short",
            Self::UShort => "UShort",
            Self::Int => "Int",
            Self::UInt => "UInt",
            Self::Long => "Long",
            Self::ULong => "ULong",
            Self::Float => "Float",
            Self::Double => "Double",
            Self::String => "String",
            Self::Vector => "Vector",
            Self::Obj => "Obj",
            Self::Union => "Union",
            Self::Array => "Array",
            Self::Vector64 => "Vector64",
        }
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        (Self::Bool..=Self::ULong).contains(&self)
    }

    #[must_use]
    pub fn is_real(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    #[must_use]
    pub fn is_scalar(self) -> bool {
        self.is_integer() || self.is_real()
    }

    /// Scalars and strings.
    #[must_use]
    pub fn is_indexable(self) -> bool {
        self.is_scalar() || self == Self::String
    }

    /// Types for which `required` is meaningful.
    #[must_use]
    pub fn is_offset_type(self) -> bool {
        matches!(self, Self::String | Self::Vector | Self::Obj)
    }
}

impl std::fmt::Display for BaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionType {
    pub base_type: BaseType,
    pub element: BaseType,
    /// Index into the schema objects (for `Obj`) or enums; `-1` when unused.
    pub index: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionField {
    pub name: String,
    pub field_type: ReflectionType,
    pub id: u16,
    /// Vtable offset of the field in a table, or byte offset in a struct.
    pub offset: u16,
    pub default_integer: i64,
    pub default_real: f64,
    pub deprecated: bool,
    pub required: bool,
    /// Attribute key to optional value.
    pub attributes: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionObject {
    pub name: String,
    pub fields: Vec<ReflectionField>,
    pub is_struct: bool,
    pub minalign: i32,
    pub bytesize: i32,
    pub attributes: BTreeMap<String, Option<String>>,
}

impl ReflectionObject {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&ReflectionField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A decoded `.bfbs` schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionSchema {
    pub objects: Vec<ReflectionObject>,
    pub root_table: Option<ReflectionObject>,
}

// Slot ids from reflection.fbs.
mod id {
    pub const TYPE_BASE_TYPE: u16 = 0;
    pub const TYPE_ELEMENT: u16 = 1;
    pub const TYPE_INDEX: u16 = 2;
    pub const TYPE_SLOTS: u16 = 3;

    pub const KV_KEY: u16 = 0;
    pub const KV_VALUE: u16 = 1;
    pub const KV_SLOTS: u16 = 2;

    pub const FIELD_NAME: u16 = 0;
    pub const FIELD_TYPE: u16 = 1;
    pub const FIELD_ID: u16 = 2;
    pub const FIELD_OFFSET: u16 = 3;
    pub const FIELD_DEFAULT_INTEGER: u16 = 4;
    pub const FIELD_DEFAULT_REAL: u16 = 5;
    pub const FIELD_DEPRECATED: u16 = 6;
    pub const FIELD_REQUIRED: u16 = 7;
    pub const FIELD_ATTRIBUTES: u16 = 9;
    pub const FIELD_SLOTS: u16 = 10;

    pub const OBJECT_NAME: u16 = 0;
    pub const OBJECT_FIELDS: u16 = 1;
    pub const OBJECT_IS_STRUCT: u16 = 2;
    pub const OBJECT_MINALIGN: u16 = 3;
    pub const OBJECT_BYTESIZE: u16 = 4;
    pub const OBJECT_ATTRIBUTES: u16 = 5;
    pub const OBJECT_SLOTS: u16 = 6;

    pub const SCHEMA_OBJECTS: u16 = 0;
    pub const SCHEMA_ROOT_TABLE: u16 = 4;
    pub const SCHEMA_SLOTS: u16 = 5;
}

fn missing(what: &str) -> SchemaError {
    SchemaError::FlatBufferVerifyFail(format!("required {what} missing"))
}

fn decode_base_type(raw: i8) -> SchemaResult<BaseType> {
    BaseType::from_i8(raw)
        .ok_or_else(|| SchemaError::FlatBufferVerifyFail(format!("unknown base type {raw}")))
}

/// Walks a verified `.bfbs` binary into owned reflection structures.
struct Decoder<'o, 'b> {
    access: Access<'o, 'b>,
}

impl Decoder<'_, '_> {
    fn scalar_or<T: Scalar>(&mut self, pos: Option<usize>, default: T) -> SchemaResult<T> {
        pos.map_or(Ok(default), |pos| self.access.scalar(pos))
    }

    fn bool_or(&mut self, pos: Option<usize>, default: bool) -> SchemaResult<bool> {
        Ok(self.scalar_or(pos, u8::from(default))? != 0)
    }

    fn string(&mut self, pos: Option<usize>) -> SchemaResult<Option<String>> {
        let Some(pos) = pos else {
            return Ok(None);
        };
        let target = self.access.follow(pos)?;
        self.access.string(target).map(|s| Some(s.to_string()))
    }

    fn tables(&mut self, pos: Option<usize>) -> SchemaResult<Vec<usize>> {
        let Some(pos) = pos else {
            return Ok(Vec::new());
        };
        let target = self.access.follow(pos)?;
        self.access.offset_vector(target)
    }

    fn reflection_type(&mut self, pos: usize) -> SchemaResult<ReflectionType> {
        let fields = self.access.table(pos, id::TYPE_SLOTS)?;
        Ok(ReflectionType {
            base_type: decode_base_type(self.scalar_or(fields.get(id::TYPE_BASE_TYPE), 0)?)?,
            element: decode_base_type(self.scalar_or(fields.get(id::TYPE_ELEMENT), 0)?)?,
            index: self.scalar_or(fields.get(id::TYPE_INDEX), -1)?,
        })
    }

    fn attributes(&mut self, pos: Option<usize>) -> SchemaResult<BTreeMap<String, Option<String>>> {
        let mut attributes = BTreeMap::new();
        for kv in self.tables(pos)? {
            let fields = self.access.table(kv, id::KV_SLOTS)?;
            let key = self
                .string(fields.get(id::KV_KEY))?
                .ok_or_else(|| missing("attribute key"))?;
            let value = self.string(fields.get(id::KV_VALUE))?;
            attributes.insert(key, value);
        }
        Ok(attributes)
    }

    fn field(&mut self, pos: usize) -> SchemaResult<ReflectionField> {
        let fields = self.access.table(pos, id::FIELD_SLOTS)?;
        let name = self
            .string(fields.get(id::FIELD_NAME))?
            .ok_or_else(|| missing("field name"))?;
        let type_pos = fields
            .get(id::FIELD_TYPE)
            .ok_or_else(|| missing("field type"))?;
        let type_pos = self.access.follow(type_pos)?;
        Ok(ReflectionField {
            name,
            field_type: self.reflection_type(type_pos)?,
            id: self.scalar_or(fields.get(id::FIELD_ID), 0)?,
            offset: self.scalar_or(fields.get(id::FIELD_OFFSET), 0)?,
            default_integer: self.scalar_or(fields.get(id::FIELD_DEFAULT_INTEGER), 0)?,
            default_real: self.scalar_or(fields.get(id::FIELD_DEFAULT_REAL), 0.0)?,
            deprecated: self.bool_or(fields.get(id::FIELD_DEPRECATED), false)?,
            required: self.bool_or(fields.get(id::FIELD_REQUIRED), false)?,
            attributes: self.attributes(fields.get(id::FIELD_ATTRIBUTES))?,
        })
    }

    fn object(&mut self, pos: usize) -> SchemaResult<ReflectionObject> {
        let fields = self.access.table(pos, id::OBJECT_SLOTS)?;
        let name = self
            .string(fields.get(id::OBJECT_NAME))?
            .ok_or_else(|| missing("object name"))?;
        let members = self
            .tables(fields.get(id::OBJECT_FIELDS))?
            .into_iter()
            .map(|field| self.field(field))
            .collect::<SchemaResult<Vec<_>>>()?;
        Ok(ReflectionObject {
            name,
            fields: members,
            is_struct: self.bool_or(fields.get(id::OBJECT_IS_STRUCT), false)?,
            minalign: self.scalar_or(fields.get(id::OBJECT_MINALIGN), 0)?,
            bytesize: self.scalar_or(fields.get(id::OBJECT_BYTESIZE), 0)?,
            attributes: self.attributes(fields.get(id::OBJECT_ATTRIBUTES))?,
        })
    }
}

impl ReflectionSchema {
    /// Verifies and decodes a size-prefixed schema binary carrying the
    /// `BFBS` file identifier.
    pub fn decode_size_prefixed(data: &[u8]) -> SchemaResult<Self> {
        let opts = VerifierOptions::default();
        let mut access = Access::new(&opts, data);
        let root = access.size_prefixed_root()?;
        access.verifier().range_in_buffer(0, SIZE_PREFIX_LEN + 8)?;
        if !buffer_has_identifier(data, SCHEMA_FILE_IDENTIFIER, true) {
            return Err(SchemaError::FlatBufferVerifyFail("missing BFBS identifier".into()));
        }
        let mut decoder = Decoder { access };
        let fields = decoder.access.table(root, id::SCHEMA_SLOTS)?;
        let objects = decoder
            .tables(fields.get(id::SCHEMA_OBJECTS))?
            .into_iter()
            .map(|object| decoder.object(object))
            .collect::<SchemaResult<Vec<_>>>()?;
        let root_table = match fields.get(id::SCHEMA_ROOT_TABLE) {
            Some(pos) => {
                let target = decoder.access.follow(pos)?;
                Some(decoder.object(target)?)
            }
            None => None,
        };
        debug!(objects = objects.len(), "decoded reflection schema");
        Ok(Self {
            objects,
            root_table,
        })
    }

    /// The object referenced by an `Obj` type index.
    #[must_use]
    pub fn object_at(&self, index: i32) -> Option<&ReflectionObject> {
        usize::try_from(index).ok().and_then(|i| self.objects.get(i))
    }

    /// Verifies the size-prefixed value `body` against `root`: every field
    /// present in the root table is checked for bounds and alignment, and
    /// required fields must be present.
    pub fn verify_root(&self, body: &[u8], root: &ReflectionObject) -> SchemaResult<()> {
        let opts = VerifierOptions::default();
        let mut access = Access::new(&opts, body);
        let pos = access.size_prefixed_root()?;
        let mut table = access.verifier().visit_table(pos)?;
        for field in &root.fields {
            table = self.visit_field(table, field)?;
        }
        table.finish();
        Ok(())
    }

    fn visit_field<'v, 'o, 'b>(
        &self,
        table: TableVerifier<'v, 'o, 'b>,
        field: &ReflectionField,
    ) -> SchemaResult<TableVerifier<'v, 'o, 'b>> {
        let name = field.name.clone();
        let (offset, required) = (field.offset, field.required);
        let ty = &field.field_type;
        let table = match ty.base_type {
            BaseType::Bool => table.visit_field::<bool>(name, offset, required)?,
            BaseType::Byte => table.visit_field::<i8>(name, offset, required)?,
            BaseType::UType | BaseType::UByte => table.visit_field::<u8>(name, offset, required)?,
            BaseType::Short => table.visit_field::<i16>(name, offset, required)?,
            BaseType::UShort => table.visit_field::<u16>(name, offset, required)?,
            BaseType::Int => table.visit_field::<i32>(name, offset, required)?,
            BaseType::UInt => table.visit_field::<u32>(name, offset, required)?,
            BaseType::Long => table.visit_field::<i64>(name, offset, required)?,
            BaseType::ULong => table.visit_field::<u64>(name, offset, required)?,
            BaseType::Float => table.visit_field::<f32>(name, offset, required)?,
            BaseType::Double => table.visit_field::<f64>(name, offset, required)?,
            BaseType::String => {
                table.visit_field::<ForwardsUOffset<&str>>(name, offset, required)?
            }
            BaseType::Vector => visit_vector(table, field)?,
            BaseType::Obj => {
                let object = self.object_at(ty.index).ok_or_else(|| {
                    SchemaError::FlatBufferVerifyFail(format!("bad object index for {name}"))
                })?;
                if !object.is_struct {
                    return Err(SchemaError::NotSupport(format!("nested table {}", object.name)));
                }
                visit_struct(table, field, object)?
            }
            other => {
                return Err(SchemaError::NotSupport(format!(
                    "field {name} of type {other} cannot be verified"
                )));
            }
        };
        Ok(table)
    }
}

macro_rules! visit_vector_of {
    ($table:expr, $field:expr, $($base:ident => $ty:ty),* $(,)?) => {
        match $field.field_type.element {
            $(BaseType::$base => $table.visit_field::<ForwardsUOffset<Vector<'_, $ty>>>(
                $field.name.clone(),
                $field.offset,
                $field.required,
            )?,)*
            BaseType::String => $table.visit_field::<ForwardsUOffset<Vector<'_, ForwardsUOffset<&str>>>>(
                $field.name.clone(),
                $field.offset,
                $field.required,
            )?,
            other => {
                return Err(SchemaError::NotSupport(format!(
                    "vector {} of {other} cannot be verified",
                    $field.name
                )));
            }
        }
    };
}

fn visit_vector<'v, 'o, 'b>(
    table: TableVerifier<'v, 'o, 'b>,
    field: &ReflectionField,
) -> SchemaResult<TableVerifier<'v, 'o, 'b>> {
    Ok(visit_vector_of!(table, field,
        Bool => bool,
        Byte => i8,
        UType => u8,
        UByte => u8,
        Short => i16,
        UShort => u16,
        Int => i32,
        UInt => u32,
        Long => i64,
        ULong => u64,
        Float => f32,
        Double => f64,
    ))
}

/// Structs are stored inline: check their alignment and extent.
fn visit_struct<'v, 'o, 'b>(
    mut table: TableVerifier<'v, 'o, 'b>,
    field: &ReflectionField,
    object: &ReflectionObject,
) -> SchemaResult<TableVerifier<'v, 'o, 'b>> {
    let Some(pos) = table.deref(field.offset)? else {
        return Ok(table);
    };
    let size = usize::try_from(object.bytesize).map_err(SchemaError::internal)?;
    let verifier = table.verifier();
    match object.minalign {
        8 => verifier.is_aligned::<u64>(pos)?,
        4 => verifier.is_aligned::<u32>(pos)?,
        2 => verifier.is_aligned::<u16>(pos)?,
        _ => {}
    }
    verifier.range_in_buffer(pos, size)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bfbs::testkit::{FieldSpec, ObjectSpec, SchemaSpec};

    #[test]
    fn base_type_numbering() {
        assert_eq!(BaseType::from_i8(0), Some(BaseType::None));
        assert_eq!(BaseType::from_i8(15), Some(BaseType::Obj));
        assert_eq!(BaseType::from_i8(18), Some(BaseType::Vector64));
        assert_eq!(BaseType::from_i8(19), None);
        assert_eq!(BaseType::from_i8(-1), None);
        assert!(BaseType::Bool.is_integer());
        assert!(!BaseType::Float.is_integer());
        assert!(BaseType::String.is_indexable());
        assert!(!BaseType::Vector.is_indexable());
    }

    #[test]
    fn decodes_built_schema() {
        let spec = SchemaSpec::new(
            ObjectSpec::table("ns.Root")
                .attr("SCHEMA_VERSION", Some("1.0"))
                .field(FieldSpec::scalar("age", BaseType::Int, 0).attr("INDEX", None))
                .field(FieldSpec::scalar("name", BaseType::String, 1).required()),
        );
        let bytes = spec.build();
        let schema = ReflectionSchema::decode_size_prefixed(&bytes).unwrap();
        let root = schema.root_table.unwrap();
        assert_eq!(root.name, "ns.Root");
        assert_eq!(root.attributes.get("SCHEMA_VERSION"), Some(&Some("1.0".to_string())));
        let age = root.field("age").unwrap();
        assert_eq!(age.field_type.base_type, BaseType::Int);
        assert_eq!(age.offset, 4);
        assert_eq!(age.attributes.get("INDEX"), Some(&None));
        assert!(root.field("name").unwrap().required);
    }

    #[test]
    fn rejects_wrong_identifier_and_size() {
        let spec = SchemaSpec::new(ObjectSpec::table("Root"));
        let mut bytes = spec.build();
        bytes[8] = b'X';
        assert!(ReflectionSchema::decode_size_prefixed(&bytes).is_err());

        let mut bytes = spec.build();
        bytes.push(0);
        assert!(ReflectionSchema::decode_size_prefixed(&bytes).is_err());
        assert!(ReflectionSchema::decode_size_prefixed(&[1, 2]).is_err());
    }

    fn point_schema(bytesize: i32) -> ReflectionSchema {
        let bytes = SchemaSpec::new(
            ObjectSpec::versioned_root("Root").field(FieldSpec::object("p", 1, 0)),
        )
        .object(
            ObjectSpec::structure("Point", 4, bytesize)
                .field(FieldSpec::scalar("x", BaseType::Int, 0).at_offset(0))
                .field(FieldSpec::scalar("y", BaseType::Int, 1).at_offset(4)),
        )
        .build();
        ReflectionSchema::decode_size_prefixed(&bytes).unwrap()
    }

    /// Root table at 16, vtable at 8, an inline struct at `at`.
    fn struct_value(at: u8) -> Vec<u8> {
        let mut body = vec![0u8; 28];
        body[..4].copy_from_slice(&24u32.to_le_bytes());
        body[4..8].copy_from_slice(&12u32.to_le_bytes());
        body[8..14].copy_from_slice(&[6, 0, 12, 0, at - 16, 0]);
        body[16..20].copy_from_slice(&8i32.to_le_bytes());
        body
    }

    #[test]
    fn struct_fields_are_checked_for_alignment_and_extent() {
        let schema = point_schema(8);
        let root = schema.root_table.clone().unwrap();
        schema.verify_root(&struct_value(20), &root).unwrap();
        assert!(schema.verify_root(&struct_value(22), &root).is_err());

        let wide = point_schema(12);
        let root = wide.root_table.clone().unwrap();
        assert!(wide.verify_root(&struct_value(20), &root).is_err());
    }

    #[test]
    fn truncated_schema_never_panics() {
        let bytes = SchemaSpec::new(
            ObjectSpec::table("Root").field(FieldSpec::scalar("a", BaseType::Long, 0)),
        )
        .build();
        for cut in 0..bytes.len() {
            let mut truncated = bytes[..cut].to_vec();
            if truncated.len() >= 4 {
                let len = u32::try_from(truncated.len() - 4).unwrap();
                truncated[..4].copy_from_slice(&len.to_le_bytes());
            }
            let _ = ReflectionSchema::decode_size_prefixed(&truncated);
        }
    }
}
