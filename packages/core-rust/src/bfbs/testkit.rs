//! Builders for reflection schemas and value buffers.
//!
//! Compiled for this crate's tests and, behind the `testkit` feature, for
//! downstream crates that need FlatBuffer fixtures without `flatc`.

use flatbuffers::{FlatBufferBuilder, TableFinishedWIPOffset, WIPOffset};

use super::access::slot;
use super::reflection::BaseType;

type Finished = WIPOffset<TableFinishedWIPOffset>;

/// One field of an [`ObjectSpec`].
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    base_type: BaseType,
    element: BaseType,
    index: i32,
    id: u16,
    offset: u16,
    default_integer: i64,
    default_real: f64,
    deprecated: bool,
    required: bool,
    attributes: Vec<(String, Option<String>)>,
}

impl FieldSpec {
    /// A table field stored at the vtable slot for `id`.
    pub fn scalar(name: &str, base_type: BaseType, id: u16) -> Self {
        Self {
            name: name.to_string(),
            base_type,
            element: BaseType::None,
            index: -1,
            id,
            offset: slot(id),
            default_integer: 0,
            default_real: 0.0,
            deprecated: false,
            required: false,
            attributes: Vec::new(),
        }
    }

    pub fn vector(name: &str, element: BaseType, id: u16) -> Self {
        Self {
            element,
            ..Self::scalar(name, BaseType::Vector, id)
        }
    }

    /// A field of object type; `object_index` indexes the schema objects,
    /// where 0 is the root table.
    pub fn object(name: &str, object_index: i32, id: u16) -> Self {
        Self {
            index: object_index,
            ..Self::scalar(name, BaseType::Obj, id)
        }
    }

    pub fn at_offset(mut self, offset: u16) -> Self {
        self.offset = offset;
        self
    }

    pub fn enum_index(mut self, index: i32) -> Self {
        self.index = index;
        self
    }

    pub fn default_integer(mut self, value: i64) -> Self {
        self.default_integer = value;
        self
    }

    pub fn default_real(mut self, value: f64) -> Self {
        self.default_real = value;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn attr(mut self, key: &str, value: Option<&str>) -> Self {
        self.attributes.push((key.to_string(), value.map(str::to_string)));
        self
    }
}

/// A table or struct of a [`SchemaSpec`].
#[derive(Debug, Clone)]
pub struct ObjectSpec {
    name: String,
    fields: Vec<FieldSpec>,
    is_struct: bool,
    minalign: i32,
    bytesize: i32,
    attributes: Vec<(String, Option<String>)>,
}

impl ObjectSpec {
    pub fn table(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
            is_struct: false,
            minalign: 1,
            bytesize: 0,
            attributes: Vec::new(),
        }
    }

    pub fn structure(name: &str, minalign: i32, bytesize: i32) -> Self {
        Self {
            is_struct: true,
            minalign,
            bytesize,
            ..Self::table(name)
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn attr(mut self, key: &str, value: Option<&str>) -> Self {
        self.attributes.push((key.to_string(), value.map(str::to_string)));
        self
    }

    /// Root table carrying the attributes a valid schema requires.
    pub fn versioned_root(name: &str) -> Self {
        Self::table(name).attr("SCHEMA_VERSION", Some("1.0"))
    }
}

/// A schema whose objects are the root table followed by `extra` objects.
#[derive(Debug, Clone)]
pub struct SchemaSpec {
    root: ObjectSpec,
    extra: Vec<ObjectSpec>,
    with_root: bool,
}

impl SchemaSpec {
    pub fn new(root: ObjectSpec) -> Self {
        Self {
            root,
            extra: Vec::new(),
            with_root: true,
        }
    }

    pub fn object(mut self, object: ObjectSpec) -> Self {
        self.extra.push(object);
        self
    }

    pub fn without_root_table(mut self) -> Self {
        self.with_root = false;
        self
    }

    /// Size-prefixed binary with the `BFBS` identifier.
    pub fn build(&self) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::new();
        let root = build_object(&mut fbb, &self.root);
        let mut objects = vec![root];
        for object in &self.extra {
            objects.push(build_object(&mut fbb, object));
        }
        let objects = fbb.create_vector(&objects);
        let start = fbb.start_table();
        fbb.push_slot_always(slot(0), objects);
        if self.with_root {
            fbb.push_slot_always(slot(4), root);
        }
        let schema = fbb.end_table(start);
        fbb.finish_size_prefixed(schema, Some("BFBS"));
        fbb.finished_data().to_vec()
    }

    pub fn build_base64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(self.build())
    }
}

fn build_attributes(
    fbb: &mut FlatBufferBuilder<'_>,
    attributes: &[(String, Option<String>)],
) -> Option<WIPOffset<()>> {
    if attributes.is_empty() {
        return None;
    }
    let mut sorted = attributes.to_vec();
    sorted.sort();
    let mut pairs = Vec::new();
    for (key, value) in &sorted {
        let key = fbb.create_string(key);
        let value = value.as_deref().map(|v| fbb.create_string(v));
        let start = fbb.start_table();
        fbb.push_slot_always(slot(0), key);
        if let Some(value) = value {
            fbb.push_slot_always(slot(1), value);
        }
        pairs.push(fbb.end_table(start));
    }
    let vector = fbb.create_vector(&pairs);
    Some(WIPOffset::new(vector.value()))
}

fn build_field(fbb: &mut FlatBufferBuilder<'_>, field: &FieldSpec) -> Finished {
    let name = fbb.create_string(&field.name);
    let start = fbb.start_table();
    fbb.push_slot::<i8>(slot(0), field.base_type as i8, 0);
    fbb.push_slot::<i8>(slot(1), field.element as i8, 0);
    fbb.push_slot::<i32>(slot(2), field.index, -1);
    let field_type = fbb.end_table(start);
    let attributes = build_attributes(fbb, &field.attributes);

    let start = fbb.start_table();
    fbb.push_slot_always(slot(0), name);
    fbb.push_slot_always(slot(1), field_type);
    fbb.push_slot::<u16>(slot(2), field.id, 0);
    fbb.push_slot::<u16>(slot(3), field.offset, 0);
    fbb.push_slot::<i64>(slot(4), field.default_integer, 0);
    fbb.push_slot::<f64>(slot(5), field.default_real, 0.0);
    fbb.push_slot::<bool>(slot(6), field.deprecated, false);
    fbb.push_slot::<bool>(slot(7), field.required, false);
    if let Some(attributes) = attributes {
        fbb.push_slot_always(slot(9), attributes);
    }
    fbb.end_table(start)
}

fn build_object(fbb: &mut FlatBufferBuilder<'_>, object: &ObjectSpec) -> Finished {
    let name = fbb.create_string(&object.name);
    let mut sorted = object.fields.clone();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let fields: Vec<Finished> = sorted.iter().map(|f| build_field(fbb, f)).collect();
    let fields = fbb.create_vector(&fields);
    let attributes = build_attributes(fbb, &object.attributes);

    let start = fbb.start_table();
    fbb.push_slot_always(slot(0), name);
    fbb.push_slot_always(slot(1), fields);
    fbb.push_slot::<bool>(slot(2), object.is_struct, false);
    fbb.push_slot::<i32>(slot(3), object.minalign, 0);
    fbb.push_slot::<i32>(slot(4), object.bytesize, 0);
    if let Some(attributes) = attributes {
        fbb.push_slot_always(slot(5), attributes);
    }
    fbb.end_table(start)
}

/// One root-table entry of a value buffer, keyed by field id.
#[derive(Debug, Clone)]
pub enum ValueEntry {
    Bool(bool),
    Byte(i8),
    UByte(u8),
    Short(i16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Ints(Vec<i32>),
}

/// Builds a size-prefixed value buffer whose root table holds `entries`.
pub fn build_value(entries: &[(u16, ValueEntry)]) -> Vec<u8> {
    let mut fbb = FlatBufferBuilder::new();
    let mut offsets = Vec::new();
    for (id, entry) in entries {
        match entry {
            ValueEntry::Str(s) => offsets.push((*id, fbb.create_string(s).value())),
            ValueEntry::Ints(v) => offsets.push((*id, fbb.create_vector(v).value())),
            _ => {}
        }
    }
    let start = fbb.start_table();
    for (id, raw) in &offsets {
        fbb.push_slot_always::<WIPOffset<()>>(slot(*id), WIPOffset::new(*raw));
    }
    for (id, entry) in entries {
        let voffset = slot(*id);
        match entry {
            ValueEntry::Bool(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::Byte(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::UByte(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::Short(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::Int(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::UInt(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::Long(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::ULong(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::Float(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::Double(v) => fbb.push_slot_always(voffset, *v),
            ValueEntry::Str(_) | ValueEntry::Ints(_) => {}
        }
    }
    let root = fbb.end_table(start);
    fbb.finish_size_prefixed(root, None);
    fbb.finished_data().to_vec()
}
