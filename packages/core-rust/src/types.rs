//! Value types describing schema fields, indexes, and compare/check outcomes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

// ---------------------------------------------------------------------------
// Field model
// ---------------------------------------------------------------------------

/// Type of one field, either declared by a schema or observed in a value.
///
/// `LeafObject` is an object without declared (or present) sub-fields;
/// `InternalObject` has sub-fields at the next depth.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    #[default]
    Null,
    Bool,
    Integer,
    Long,
    Double,
    String,
    Array,
    LeafObject,
    InternalObject,
}

impl FieldType {
    /// Canonical upper-case name, as used in attribute strings and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool => "BOOL",
            Self::Integer => "INTEGER",
            Self::Long => "LONG",
            Self::Double => "DOUBLE",
            Self::String => "STRING",
            Self::Array => "ARRAY",
            Self::LeafObject => "LEAF_OBJECT",
            Self::InternalObject => "INTERNAL_OBJECT",
        }
    }

    /// Scalar types that may carry a default and be indexed.
    #[must_use]
    pub fn is_indexable(self) -> bool {
        matches!(
            self,
            Self::Bool | Self::Integer | Self::Long | Self::Double | Self::String
        )
    }

    #[must_use]
    pub fn is_object(self) -> bool {
        matches!(self, Self::LeafObject | Self::InternalObject)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar value carried by a default, a query operand, or an extraction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl FieldValue {
    /// The field type this value naturally maps to.
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Null => FieldType::Null,
            Self::Bool(_) => FieldType::Bool,
            Self::Integer(_) => FieldType::Integer,
            Self::Long(_) => FieldType::Long,
            Self::Double(_) => FieldType::Double,
            Self::String(_) => FieldType::String,
        }
    }

    /// Bitwise equality: doubles compare by their IEEE-754 layout, so two
    /// defaults that differ only in the last ulp are still distinct.
    #[must_use]
    pub fn binary_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }
}

/// Ordered sequence of field names from the document root.
///
/// Rendered as `$.a.b.c`; the empty path renders as `$` and denotes the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// The root path (no segments).
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Zero-based depth of the field the path points at; `None` for the root.
    #[must_use]
    pub fn depth(&self) -> Option<usize> {
        self.0.len().checked_sub(1)
    }

    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// A new path with `name` appended.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        Self(segments)
    }

    /// Drops the first segment, re-rooting the path one level down.
    #[must_use]
    pub fn without_first(&self) -> Self {
        Self(self.0.iter().skip(1).cloned().collect())
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.0 {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

impl From<Vec<String>> for FieldPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Declared properties of one schema field.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SchemaAttribute {
    pub field_type: FieldType,
    pub is_indexable: bool,
    pub not_null: bool,
    /// `Some` only when the field declares a non-null default.
    pub default_value: Option<FieldValue>,
}

impl SchemaAttribute {
    /// Attribute of a structural (array or object) field: never indexable,
    /// no constraints.
    #[must_use]
    pub fn structural(field_type: FieldType) -> Self {
        Self {
            field_type,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_default_value(&self) -> bool {
        self.default_value.is_some()
    }
}

/// One depth level of a define: path to attribute.
pub type DefineLevel = BTreeMap<FieldPath, SchemaAttribute>;

/// All declared fields, partitioned by depth for level-by-level traversal.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaDefine {
    levels: BTreeMap<usize, DefineLevel>,
}

impl SchemaDefine {
    /// Fields declared at `depth`, if any.
    #[must_use]
    pub fn level(&self, depth: usize) -> Option<&DefineLevel> {
        self.levels.get(&depth).filter(|level| !level.is_empty())
    }

    #[must_use]
    pub fn get(&self, path: &FieldPath) -> Option<&SchemaAttribute> {
        let depth = path.depth()?;
        self.levels.get(&depth)?.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &FieldPath) -> bool {
        self.get(path).is_some()
    }

    /// Total number of declared field paths across all depths.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.levels.values().map(BTreeMap::len).sum()
    }

    /// Iterates fields depth by depth, in path order within a depth.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldPath, &SchemaAttribute)> {
        self.levels.values().flat_map(BTreeMap::iter)
    }

    /// Inserts `attr` at the depth implied by `path`. Returns `false` when
    /// the path is the root or already declared.
    pub(crate) fn insert(&mut self, path: FieldPath, attr: SchemaAttribute) -> bool {
        let Some(depth) = path.depth() else {
            return false;
        };
        let level = self.levels.entry(depth).or_default();
        if level.contains_key(&path) {
            return false;
        }
        level.insert(path, attr);
        true
    }
}

// ---------------------------------------------------------------------------
// Schema-level enums
// ---------------------------------------------------------------------------

/// Kind of schema attached to a store. The numeric tag is exchanged with
/// remote peers during sync negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SchemaType {
    /// No schema: a plain key-value store.
    #[default]
    None,
    Json,
    FlatBuffer,
    Unrecognized,
}

impl SchemaType {
    /// Decodes a peer-supplied tag; anything past the known range is
    /// `Unrecognized`.
    #[must_use]
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::None,
            1 => Self::Json,
            2 => Self::FlatBuffer,
            _ => Self::Unrecognized,
        }
    }

    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Json => 1,
            Self::FlatBuffer => 2,
            Self::Unrecognized => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Json => "JSON-SCHEMA",
            Self::FlatBuffer => "FLATBUFFER-SCHEMA",
            Self::Unrecognized => "UNRECOGNIZED",
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Growth policy of a JSON schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaMode {
    /// Values may not carry undeclared fields; later schemas may not add fields.
    #[default]
    Strict,
    Compatible,
}

impl SchemaMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "STRICT",
            Self::Compatible => "COMPATIBLE",
        }
    }
}

impl fmt::Display for SchemaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

/// An index is named by its first (sort) column.
pub type IndexName = FieldPath;

/// Ordered columns of a (possibly composite) index.
pub type IndexInfo = Vec<(FieldPath, FieldType)>;

/// Changes needed to move one schema's index set to another's.
///
/// The three sets never share an index name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexDifference {
    /// Indexes present in both schemas whose columns differ (new definition).
    pub change: BTreeMap<IndexName, IndexInfo>,
    /// Indexes only in the new schema.
    pub increase: BTreeMap<IndexName, IndexInfo>,
    /// Indexes only in the old schema.
    pub decrease: BTreeSet<IndexName>,
}

impl IndexDifference {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.change.is_empty() && self.increase.is_empty() && self.decrease.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Relationship of a new schema to an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaCompareResult {
    EqualExactly,
    /// Same define, different indexes.
    UnequalCompatible,
    /// The new define is a superset old data still satisfies.
    UnequalCompatibleUpgrade,
    UnequalIncompatible,
}

impl SchemaCompareResult {
    #[must_use]
    pub fn is_incompatible(self) -> bool {
        self == Self::UnequalIncompatible
    }
}

impl fmt::Display for SchemaCompareResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EqualExactly => "EQUAL_EXACTLY",
            Self::UnequalCompatible => "UNEQUAL_COMPATIBLE",
            Self::UnequalCompatibleUpgrade => "UNEQUAL_COMPATIBLE_UPGRADE",
            Self::UnequalIncompatible => "UNEQUAL_INCOMPATIBLE",
        };
        f.write_str(name)
    }
}

/// Successful outcome of checking a value against a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCheckResult {
    Match,
    /// The value conformed after defaults were inserted for absent fields.
    MatchAmended,
}

/// Where a checked value came from. Only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueSource {
    #[default]
    FromLocal,
    FromSync,
    FromDbfile,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_path_rendering() {
        assert_eq!(FieldPath::root().to_string(), "$");
        assert_eq!(FieldPath::new(["a", "b", "c"]).to_string(), "$.a.b.c");
        assert_eq!(FieldPath::new(["a"]).depth(), Some(0));
        assert_eq!(FieldPath::root().depth(), None);
    }

    #[test]
    fn field_path_child_and_rerooting() {
        let path = FieldPath::new(["SCHEMA_DEFINE", "x"]).child("y");
        assert_eq!(path.to_string(), "$.SCHEMA_DEFINE.x.y");
        assert_eq!(path.without_first(), FieldPath::new(["x", "y"]));
        assert_eq!(path.last(), Some("y"));
    }

    #[test]
    fn schema_type_tags() {
        assert_eq!(SchemaType::from_tag(0), SchemaType::None);
        assert_eq!(SchemaType::from_tag(1), SchemaType::Json);
        assert_eq!(SchemaType::from_tag(2), SchemaType::FlatBuffer);
        assert_eq!(SchemaType::from_tag(3), SchemaType::Unrecognized);
        assert_eq!(SchemaType::from_tag(200), SchemaType::Unrecognized);
        assert_eq!(SchemaType::Json.as_str(), "JSON-SCHEMA");
    }

    #[test]
    fn field_type_names() {
        assert_eq!(FieldType::LeafObject.as_str(), "LEAF_OBJECT");
        assert_eq!(FieldType::InternalObject.to_string(), "INTERNAL_OBJECT");
        assert!(FieldType::Double.is_indexable());
        assert!(!FieldType::Array.is_indexable());
    }

    #[test]
    fn double_default_binary_equality() {
        let a = FieldValue::Double(0.1 + 0.2);
        let b = FieldValue::Double(0.3);
        assert!(!a.binary_eq(&b));
        assert!(a.binary_eq(&a.clone()));
        assert!(!FieldValue::Double(0.0).binary_eq(&FieldValue::Double(-0.0)));
    }

    #[test]
    fn define_partitions_by_depth() {
        let mut define = SchemaDefine::default();
        assert!(define.insert(FieldPath::new(["a"]), SchemaAttribute::structural(FieldType::InternalObject)));
        assert!(define.insert(FieldPath::new(["a", "b"]), SchemaAttribute::structural(FieldType::Array)));
        assert!(!define.insert(FieldPath::new(["a"]), SchemaAttribute::default()));
        assert!(!define.insert(FieldPath::root(), SchemaAttribute::default()));
        assert_eq!(define.field_count(), 2);
        assert_eq!(define.level(1).map(BTreeMap::len), Some(1));
        assert!(define.level(2).is_none());
        assert!(define.contains(&FieldPath::new(["a", "b"])));
    }

    #[test]
    fn field_path_serializes_as_string() {
        let json = serde_json::to_string(&FieldPath::new(["a", "b"])).unwrap();
        assert_eq!(json, "\"$.a.b\"");
    }
}
