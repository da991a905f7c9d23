//! JSON documents as stored values: an opaque skip prefix followed by a
//! JSON object.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::error::{SchemaError, SchemaResult};
use crate::limits::JSON_MAX_NEST_DEPTH;
use crate::types::{FieldPath, FieldType, FieldValue};

/// Maximum combined object/array nesting of `data`, counted outside string
/// literals. Runs before the real parser so that hostile input is rejected
/// without recursion.
#[must_use]
pub fn calculate_nest_depth(data: &[u8]) -> usize {
    let mut in_string = false;
    let mut max_depth = 0usize;
    let mut object_depth = 0usize;
    let mut array_depth = 0usize;
    let mut escapes = 0usize;

    for &byte in data {
        if byte == b'"' && escapes % 2 == 0 {
            in_string = !in_string;
            escapes = 0;
            continue;
        }
        if !in_string {
            match byte {
                b'{' => {
                    object_depth += 1;
                    max_depth = max_depth.max(object_depth + array_depth);
                }
                b'}' => object_depth = object_depth.saturating_sub(1),
                b'[' => {
                    array_depth += 1;
                    max_depth = max_depth.max(object_depth + array_depth);
                }
                b']' => array_depth = array_depth.saturating_sub(1),
                _ => {}
            }
        }
        escapes = if byte == b'\\' { escapes + 1 } else { 0 };
    }
    max_depth
}

/// Classifies a JSON node into a [`FieldType`].
///
/// Integers in `i32` range are `Integer`, the rest of `i64` is `Long`, and
/// anything larger, or written with a fraction or exponent, is `Double`.
#[must_use]
pub fn field_type_of(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::Bool(_) => FieldType::Bool,
        Value::Number(n) => number_type(n),
        Value::String(_) => FieldType::String,
        Value::Array(_) => FieldType::Array,
        Value::Object(map) if map.is_empty() => FieldType::LeafObject,
        Value::Object(_) => FieldType::InternalObject,
    }
}

fn number_type(n: &Number) -> FieldType {
    match n.as_i64() {
        Some(v) if i32::try_from(v).is_ok() => FieldType::Integer,
        Some(_) => FieldType::Long,
        None => FieldType::Double,
    }
}

fn json_to_field_value(value: &Value) -> SchemaResult<FieldValue> {
    let out = match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => match (number_type(n), n.as_i64()) {
            (FieldType::Integer, Some(v)) => {
                FieldValue::Integer(i32::try_from(v).map_err(SchemaError::internal)?)
            }
            (FieldType::Long, Some(v)) => FieldValue::Long(v),
            _ => FieldValue::Double(
                n.as_f64()
                    .ok_or_else(|| SchemaError::internal("number not representable"))?,
            ),
        },
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(SchemaError::NotSupport(format!(
                "{} has no scalar value",
                field_type_of(value)
            )));
        }
    };
    Ok(out)
}

fn field_value_to_json(field_type: FieldType, value: &FieldValue) -> SchemaResult<Value> {
    let out = match (field_type, value) {
        (FieldType::Null, _) => Value::Null,
        (FieldType::Bool, FieldValue::Bool(b)) => Value::Bool(*b),
        (FieldType::Integer, FieldValue::Integer(v)) => Value::from(*v),
        (FieldType::Long, FieldValue::Long(v)) => Value::from(*v),
        (FieldType::Long, FieldValue::Integer(v)) => Value::from(i64::from(*v)),
        (FieldType::Double, FieldValue::Double(v)) => Number::from_f64(*v)
            .map(Value::Number)
            .ok_or_else(|| SchemaError::InvalidArgs("non-finite double".into()))?,
        (FieldType::String, FieldValue::String(s)) => Value::String(s.clone()),
        (FieldType::LeafObject, _) => Value::Object(Map::new()),
        _ => {
            return Err(SchemaError::InvalidArgs(format!(
                "value {value:?} cannot be stored as {field_type}"
            )));
        }
    };
    Ok(out)
}

/// A parsed value: the raw skip prefix plus the JSON object after it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueObject {
    prefix: Vec<u8>,
    root: Value,
}

impl Default for ValueObject {
    fn default() -> Self {
        Self {
            prefix: Vec::new(),
            root: Value::Object(Map::new()),
        }
    }
}

impl ValueObject {
    /// Parses `data`, treating its first `skip_size` bytes as an opaque
    /// prefix.
    pub fn parse(data: &[u8], skip_size: u32) -> SchemaResult<Self> {
        let skip = usize::try_from(skip_size).map_err(SchemaError::internal)?;
        if data.len() <= skip {
            return Err(SchemaError::InvalidArgs(format!(
                "value of {} bytes does not extend past skip size {skip}",
                data.len()
            )));
        }
        let (prefix, body) = data.split_at(skip);
        let nest_depth = calculate_nest_depth(body);
        if nest_depth > JSON_MAX_NEST_DEPTH {
            warn!(nest_depth, "json nest depth exceeds limit");
            return Err(SchemaError::JsonParseFail(format!(
                "nest depth {nest_depth} exceeds {JSON_MAX_NEST_DEPTH}"
            )));
        }
        let root: Value =
            serde_json::from_slice(body).map_err(|e| SchemaError::JsonParseFail(e.to_string()))?;
        if !root.is_object() {
            return Err(SchemaError::JsonParseFail("root is not an object".into()));
        }
        Ok(Self {
            prefix: prefix.to_vec(),
            root,
        })
    }

    /// Parses a JSON text with no prefix.
    pub fn parse_str(text: &str) -> SchemaResult<Self> {
        if text.is_empty() {
            return Err(SchemaError::InvalidArgs("empty json text".into()));
        }
        Self::parse(text.as_bytes(), 0)
    }

    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn node(&self, path: &FieldPath) -> Option<&Value> {
        path.segments()
            .iter()
            .try_fold(&self.root, |node, segment| node.as_object()?.get(segment))
    }

    #[must_use]
    pub fn is_field_path_exist(&self, path: &FieldPath) -> bool {
        self.node(path).is_some()
    }

    pub fn field_type(&self, path: &FieldPath) -> SchemaResult<FieldType> {
        self.node(path)
            .map(field_type_of)
            .ok_or_else(|| SchemaError::NotFound(format!("no field at {path}")))
    }

    /// Scalar value at `path`. Arrays and objects are `NotSupport`.
    pub fn field_value(&self, path: &FieldPath) -> SchemaResult<FieldValue> {
        let node = self
            .node(path)
            .ok_or_else(|| SchemaError::NotFound(format!("no field at {path}")))?;
        json_to_field_value(node)
    }

    /// Direct children of each object in `paths`, keyed by full path.
    /// Paths absent from the document are skipped; a path that exists but
    /// is not an object is `NotSupport`.
    pub fn sub_field_types<'p, I>(&self, paths: I) -> SchemaResult<BTreeMap<FieldPath, FieldType>>
    where
        I: IntoIterator<Item = &'p FieldPath>,
    {
        let mut out = BTreeMap::new();
        for path in paths {
            let Some(node) = self.node(path) else {
                continue;
            };
            let map = node
                .as_object()
                .ok_or_else(|| SchemaError::NotSupport(format!("{path} is not an object")))?;
            out.extend(
                map.iter()
                    .map(|(name, child)| (path.child(name), field_type_of(child))),
            );
        }
        Ok(out)
    }

    /// Length of the array at `path`.
    pub fn array_len(&self, path: &FieldPath) -> SchemaResult<usize> {
        self.node(path)
            .ok_or_else(|| SchemaError::NotFound(format!("no field at {path}")))?
            .as_array()
            .map(Vec::len)
            .ok_or_else(|| SchemaError::NotSupport(format!("{path} is not an array")))
    }

    /// Reads an array whose items are strings or arrays of strings. Each
    /// string becomes a one-element group, empty inner arrays are skipped.
    pub fn string_or_string_array(&self, path: &FieldPath) -> SchemaResult<Vec<Vec<String>>> {
        let node = self
            .node(path)
            .ok_or_else(|| SchemaError::NotFound(format!("no field at {path}")))?;
        let items = node
            .as_array()
            .ok_or_else(|| SchemaError::NotSupport(format!("{path} is not an array")))?;
        let mut groups = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            match item {
                Value::String(s) => groups.push(vec![s.clone()]),
                Value::Array(inner) if inner.is_empty() => {}
                Value::Array(inner) => {
                    let group = inner
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| {
                            SchemaError::NotSupport(format!("non-string member in item {index}"))
                        })?;
                    groups.push(group);
                }
                _ => {
                    return Err(SchemaError::NotSupport(format!(
                        "item {index} is neither a string nor an array"
                    )));
                }
            }
        }
        Ok(groups)
    }

    /// Inserts a scalar or an empty object at `path`, creating missing
    /// intermediate objects.
    pub fn insert_field(
        &mut self,
        path: &FieldPath,
        field_type: FieldType,
        value: &FieldValue,
    ) -> SchemaResult<()> {
        if path.is_empty()
            || path.len() > JSON_MAX_NEST_DEPTH
            || matches!(field_type, FieldType::Array | FieldType::InternalObject)
        {
            return Err(SchemaError::InvalidArgs(format!(
                "cannot insert {field_type} at {path}"
            )));
        }
        let leaf = field_value_to_json(field_type, value)?;
        if self.is_field_path_exist(path) {
            return Err(SchemaError::JsonInsertPathExist(path.to_string()));
        }

        let mut node = &mut self.root;
        let mut created = false;
        for segment in path.segments() {
            if created {
                node = insert_member(node, segment)?;
                continue;
            }
            let Value::Object(map) = node else {
                return Err(SchemaError::JsonInsertPathConflict(path.to_string()));
            };
            if !map.contains_key(segment) {
                created = true;
            }
            node = map.entry(segment.clone()).or_insert(Value::Null);
            if created {
                *node = Value::Object(Map::new());
            }
        }
        *node = leaf;
        debug!(%path, %field_type, "inserted field");
        Ok(())
    }

    /// Removes the member at `path`.
    pub fn delete_field(&mut self, path: &FieldPath) -> SchemaResult<()> {
        let Some((last, parents)) = path.segments().split_last() else {
            return Err(SchemaError::InvalidArgs("cannot delete the root".into()));
        };
        let parent = parents
            .iter()
            .try_fold(&mut self.root, |node, segment| {
                node.as_object_mut()?.get_mut(segment)
            })
            .and_then(Value::as_object_mut);
        match parent.and_then(|map| map.remove(last)) {
            Some(_) => Ok(()),
            None => Err(SchemaError::JsonDeletePathNotFound(path.to_string())),
        }
    }

    /// Compact JSON text of the document, without the prefix.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        self.root.to_string()
    }

    /// Prefix followed by the compact JSON text.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(self.root.to_string().as_bytes());
        out
    }
}

fn insert_member<'a>(node: &'a mut Value, segment: &str) -> SchemaResult<&'a mut Value> {
    let map = node
        .as_object_mut()
        .ok_or_else(|| SchemaError::internal("created node is not an object"))?;
    Ok(map
        .entry(segment.to_string())
        .or_insert_with(|| Value::Object(Map::new())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> FieldPath {
        crate::utils::parse_and_check_field_path(text).unwrap()
    }

    #[test]
    fn nest_depth_ignores_brackets_in_strings() {
        assert_eq!(calculate_nest_depth(br#"{"a":{"b":[1,[2]]}}"#), 4);
        assert_eq!(calculate_nest_depth(br#"{"a":"{{[[","b":{}}"#), 2);
        assert_eq!(calculate_nest_depth(br#"{"a":"x\"{{","b":1}"#), 1);
        assert_eq!(calculate_nest_depth(br#"{"a":"x\\","b":{}}"#), 2);
        assert_eq!(calculate_nest_depth(b""), 0);
    }

    #[test]
    fn parse_rejects_deep_and_non_object() {
        let deep = format!("{}{}", "[".repeat(101), "]".repeat(101));
        let deep = format!(r#"{{"a":{deep}}}"#);
        assert!(matches!(ValueObject::parse_str(&deep), Err(SchemaError::JsonParseFail(_))));
        assert!(matches!(ValueObject::parse_str("[1]"), Err(SchemaError::JsonParseFail(_))));
        assert!(matches!(ValueObject::parse_str("{"), Err(SchemaError::JsonParseFail(_))));
        assert!(matches!(ValueObject::parse_str(""), Err(SchemaError::InvalidArgs(_))));
    }

    #[test]
    fn parse_with_skip_prefix() {
        let data = b"\x01\x02{\"a\":1}";
        let obj = ValueObject::parse(data, 2).unwrap();
        assert_eq!(obj.prefix(), b"\x01\x02");
        assert_eq!(obj.to_bytes(), data.to_vec());
        assert!(ValueObject::parse(b"ab", 2).is_err());
    }

    #[test]
    fn number_classification() {
        let obj = ValueObject::parse_str(
            r#"{"i":2147483647,"l":2147483648,"n":-2147483649,"u":18446744073709551615,"d":1.0}"#,
        )
        .unwrap();
        assert_eq!(obj.field_type(&path("i")).unwrap(), FieldType::Integer);
        assert_eq!(obj.field_type(&path("l")).unwrap(), FieldType::Long);
        assert_eq!(obj.field_type(&path("n")).unwrap(), FieldType::Long);
        assert_eq!(obj.field_type(&path("u")).unwrap(), FieldType::Double);
        assert_eq!(obj.field_type(&path("d")).unwrap(), FieldType::Double);
        assert_eq!(obj.field_value(&path("l")).unwrap(), FieldValue::Long(2_147_483_648));
    }

    #[test]
    fn object_types_and_sub_fields() {
        let obj = ValueObject::parse_str(r#"{"a":{},"b":{"c":true,"d":[]}}"#).unwrap();
        assert_eq!(obj.field_type(&path("a")).unwrap(), FieldType::LeafObject);
        assert_eq!(obj.field_type(&path("b")).unwrap(), FieldType::InternalObject);
        let subs = obj.sub_field_types([&path("b"), &path("missing")]).unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs.get(&path("b.c")), Some(&FieldType::Bool));
        assert_eq!(subs.get(&path("b.d")), Some(&FieldType::Array));
        let root = obj.sub_field_types([&FieldPath::root()]).unwrap();
        assert_eq!(root.len(), 2);
        assert!(matches!(
            obj.sub_field_types([&path("b.c")]),
            Err(SchemaError::NotSupport(_))
        ));
        assert!(matches!(obj.field_type(&path("z")), Err(SchemaError::NotFound(_))));
    }

    #[test]
    fn string_or_string_array_groups() {
        let obj = ValueObject::parse_str(r#"{"x":["a",[],["b","c"]],"y":["a",1]}"#).unwrap();
        assert_eq!(
            obj.string_or_string_array(&path("x")).unwrap(),
            vec![vec!["a".to_string()], vec!["b".to_string(), "c".to_string()]]
        );
        assert!(obj.string_or_string_array(&path("y")).is_err());
        assert_eq!(obj.array_len(&path("y")).unwrap(), 2);
    }

    #[test]
    fn insert_creates_intermediate_objects() {
        let mut obj = ValueObject::parse_str(r#"{"a":{}}"#).unwrap();
        obj.insert_field(&path("a.b.c"), FieldType::Long, &FieldValue::Long(7))
            .unwrap();
        assert_eq!(obj.to_json_string(), r#"{"a":{"b":{"c":7}}}"#);
        obj.insert_field(&path("e"), FieldType::LeafObject, &FieldValue::Null)
            .unwrap();
        assert_eq!(obj.field_type(&path("e")).unwrap(), FieldType::LeafObject);
    }

    #[test]
    fn insert_rejections() {
        let mut obj = ValueObject::parse_str(r#"{"a":1}"#).unwrap();
        assert!(matches!(
            obj.insert_field(&path("a"), FieldType::Integer, &FieldValue::Integer(2)),
            Err(SchemaError::JsonInsertPathExist(_))
        ));
        assert!(matches!(
            obj.insert_field(&path("a.b"), FieldType::Integer, &FieldValue::Integer(2)),
            Err(SchemaError::JsonInsertPathConflict(_))
        ));
        assert!(matches!(
            obj.insert_field(&path("d"), FieldType::Double, &FieldValue::Double(f64::NAN)),
            Err(SchemaError::InvalidArgs(_))
        ));
        assert!(matches!(
            obj.insert_field(&path("d"), FieldType::Array, &FieldValue::Null),
            Err(SchemaError::InvalidArgs(_))
        ));
        assert_eq!(obj.to_json_string(), r#"{"a":1}"#);
    }

    #[test]
    fn delete_field_paths() {
        let mut obj = ValueObject::parse_str(r#"{"a":{"b":1},"c":2}"#).unwrap();
        obj.delete_field(&path("a.b")).unwrap();
        assert_eq!(obj.to_json_string(), r#"{"a":{},"c":2}"#);
        assert!(matches!(
            obj.delete_field(&path("a.b")),
            Err(SchemaError::JsonDeletePathNotFound(_))
        ));
        assert!(matches!(
            obj.delete_field(&path("c.d")),
            Err(SchemaError::JsonDeletePathNotFound(_))
        ));
    }
}
