//! Schema objects: parsing, comparison, and value checking for JSON and
//! FlatBuffer schemas.
//!
//! A [`SchemaObject`] is built once by [`SchemaObject::parse`] and is
//! immutable afterwards. The default value is the schema-less (KV) object.

mod flatbuffer;
mod json;
pub mod sync;

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::bfbs::{self, ReflectionSchema};
use crate::error::{SchemaError, SchemaResult};
use crate::limits::SCHEMA_STRING_SIZE_LIMIT;
use crate::types::{
    FieldPath, FieldType, FieldValue, IndexDifference, IndexInfo, IndexName,
    SchemaCompareResult, SchemaDefine, SchemaMode, SchemaType, ValueCheckResult, ValueSource,
};
use crate::utils;
use crate::value::ValueObject;

pub use sync::{conclude_sync_strategy, make_local_sync_opinion, SyncOpinion, SyncStrategy};

/// Type-specific payload of a schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SchemaVariant {
    /// No schema: the store is a plain key-value store.
    #[default]
    None,
    Json {
        /// Minified JSON with keys in sorted order.
        canonical: String,
    },
    FlatBuffer {
        /// Decoded `.bfbs` binary as persisted.
        raw: Vec<u8>,
        reflection: ReflectionSchema,
        description: String,
    },
}

/// Parsed state shared by both schema kinds.
#[derive(Debug, Clone, Default, PartialEq)]
struct SchemaParts {
    mode: SchemaMode,
    skip_size: u32,
    define: SchemaDefine,
    indexes: BTreeMap<IndexName, IndexInfo>,
}

impl SchemaParts {
    /// Adds one index whose name is its first field path. Every path must be
    /// a declared indexable field.
    fn add_index(&mut self, raw_paths: &[String]) -> SchemaResult<()> {
        let mut paths: Vec<FieldPath> = Vec::with_capacity(raw_paths.len());
        for raw in raw_paths {
            let path = utils::parse_and_check_field_path(raw).map_err(|_| {
                warn!(path = %raw, "invalid index field path");
                SchemaError::parse(format!("invalid index path {raw:?}"))
            })?;
            if paths.contains(&path) {
                warn!(%path, "duplicate field within index");
                return Err(SchemaError::parse(format!("index repeats {path}")));
            }
            paths.push(path);
        }
        let Some(name) = paths.first().cloned() else {
            return Err(SchemaError::internal("index without fields"));
        };
        if self.indexes.contains_key(&name) {
            warn!(index = %name, "index defined twice");
            return Err(SchemaError::parse(format!("index {name} already defined")));
        }
        let mut info = IndexInfo::with_capacity(paths.len());
        for path in paths {
            match self.define.get(&path) {
                Some(attr) if attr.is_indexable => info.push((path, attr.field_type)),
                Some(_) => {
                    warn!(%path, "index field not indexable");
                    return Err(SchemaError::parse(format!("{path} is not indexable")));
                }
                None => {
                    warn!(%path, "index field not declared");
                    return Err(SchemaError::parse(format!("{path} is not declared")));
                }
            }
        }
        self.indexes.insert(name, info);
        Ok(())
    }
}

/// An immutable, validated schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaObject {
    parts: SchemaParts,
    variant: SchemaVariant,
}

impl SchemaObject {
    /// Parses a JSON schema, or a FlatBuffer schema given raw or Base64
    /// encoded.
    pub fn parse(input: impl AsRef<[u8]>) -> SchemaResult<Self> {
        let input = input.as_ref();
        let decoded = bfbs::detect_schema_binary(input);
        let original = decoded.as_deref().unwrap_or(input);
        if original.len() > SCHEMA_STRING_SIZE_LIMIT {
            warn!(size = original.len(), "schema too large");
            return Err(SchemaError::InvalidArgs(format!(
                "schema of {} bytes exceeds {SCHEMA_STRING_SIZE_LIMIT}",
                original.len()
            )));
        }
        let schema = match decoded {
            Some(raw) => {
                let (parts, reflection, description) = flatbuffer::parse(&raw)?;
                debug!(%description, "parsed flatbuffer schema");
                Self {
                    parts,
                    variant: SchemaVariant::FlatBuffer {
                        raw,
                        reflection,
                        description,
                    },
                }
            }
            None => {
                let (parts, canonical) = json::parse(input)?;
                debug!(schema = %canonical, "parsed json schema");
                Self {
                    parts,
                    variant: SchemaVariant::Json { canonical },
                }
            }
        };
        info!(
            schema_type = %schema.schema_type(),
            fields = schema.parts.define.field_count(),
            indexes = schema.parts.indexes.len(),
            "schema parsed"
        );
        Ok(schema)
    }

    /// `false` only for the schema-less default object.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !matches!(self.variant, SchemaVariant::None)
    }

    #[must_use]
    pub fn schema_type(&self) -> SchemaType {
        match self.variant {
            SchemaVariant::None => SchemaType::None,
            SchemaVariant::Json { .. } => SchemaType::Json,
            SchemaVariant::FlatBuffer { .. } => SchemaType::FlatBuffer,
        }
    }

    #[must_use]
    pub fn variant(&self) -> &SchemaVariant {
        &self.variant
    }

    /// Canonical JSON text, or the Base64 form of a FlatBuffer schema.
    #[must_use]
    pub fn to_schema_string(&self) -> String {
        match &self.variant {
            SchemaVariant::None => String::new(),
            SchemaVariant::Json { canonical } => canonical.clone(),
            SchemaVariant::FlatBuffer { raw, .. } => {
                base64::engine::general_purpose::STANDARD.encode(raw)
            }
        }
    }

    /// The persisted form: canonical JSON bytes, or the raw `.bfbs` binary.
    #[must_use]
    pub fn schema_bytes(&self) -> Vec<u8> {
        match &self.variant {
            SchemaVariant::None => Vec::new(),
            SchemaVariant::Json { canonical } => canonical.as_bytes().to_vec(),
            SchemaVariant::FlatBuffer { raw, .. } => raw.clone(),
        }
    }

    /// Human-readable summary of a FlatBuffer schema; empty otherwise.
    #[must_use]
    pub fn description(&self) -> &str {
        match &self.variant {
            SchemaVariant::FlatBuffer { description, .. } => description,
            _ => "",
        }
    }

    #[must_use]
    pub fn mode(&self) -> SchemaMode {
        self.parts.mode
    }

    #[must_use]
    pub fn skip_size(&self) -> u32 {
        self.parts.skip_size
    }

    #[must_use]
    pub fn define(&self) -> &SchemaDefine {
        &self.parts.define
    }

    #[must_use]
    pub fn indexes(&self) -> &BTreeMap<IndexName, IndexInfo> {
        &self.parts.indexes
    }

    #[must_use]
    pub fn is_index_exist(&self, name: &IndexName) -> bool {
        self.parts.indexes.contains_key(name)
    }

    /// Type of a declared field that may be used in a query.
    pub fn check_queryable_and_get_field_type(&self, path: &FieldPath) -> SchemaResult<FieldType> {
        if path.is_empty() {
            return Err(SchemaError::InvalidArgs("root path is not queryable".into()));
        }
        let attr = self
            .parts
            .define
            .get(path)
            .ok_or_else(|| SchemaError::NotFound(format!("{path} not declared")))?;
        if !attr.is_indexable {
            return Err(SchemaError::NotSupport(format!("{path} is not indexable")));
        }
        Ok(attr.field_type)
    }

    /// Parses `other` and compares it as the newer schema.
    pub fn compare_against_schema_string(
        &self,
        other: impl AsRef<[u8]>,
    ) -> SchemaResult<(SchemaCompareResult, IndexDifference)> {
        if !self.is_valid() {
            return Err(SchemaError::NotPermit("compare on schema-less object".into()));
        }
        let newer = Self::parse(other)?;
        self.compare_against_schema_object(&newer)
    }

    /// Compares `newer` against `self` (the older schema). The index
    /// difference is only meaningful when the result is not incompatible.
    pub fn compare_against_schema_object(
        &self,
        newer: &Self,
    ) -> SchemaResult<(SchemaCompareResult, IndexDifference)> {
        use SchemaCompareResult::{EqualExactly, UnequalCompatible, UnequalIncompatible};

        if !self.is_valid() || !newer.is_valid() {
            return Err(SchemaError::NotPermit("compare on schema-less object".into()));
        }
        let incompatible = Ok((UnequalIncompatible, IndexDifference::default()));
        if self.schema_type() != newer.schema_type() {
            warn!(old = %self.schema_type(), new = %newer.schema_type(), "schema type differs");
            return incompatible;
        }
        if self.schema_type() == SchemaType::Json && self.parts.mode != newer.parts.mode {
            warn!(old = %self.parts.mode, new = %newer.parts.mode, "schema mode differs");
            return incompatible;
        }
        if self.parts.skip_size != newer.parts.skip_size {
            warn!(old = self.parts.skip_size, new = newer.parts.skip_size, "skip size differs");
            return incompatible;
        }
        let define_result = match (&self.variant, &newer.variant) {
            (
                SchemaVariant::FlatBuffer { reflection: old, .. },
                SchemaVariant::FlatBuffer { reflection: new, .. },
            ) => flatbuffer::compare_define(old, new)?,
            _ => json::compare_define(self.parts.mode, &self.parts.define, &newer.parts.define),
        };
        if define_result == UnequalIncompatible {
            return incompatible;
        }
        let difference = compare_indexes(&self.parts.indexes, &newer.parts.indexes);
        let index_result = if difference.is_empty() {
            EqualExactly
        } else {
            UnequalCompatible
        };
        let result = if define_result == EqualExactly {
            index_result
        } else {
            define_result
        };
        debug!(%result, "schema compared");
        Ok((result, difference))
    }

    /// Checks a JSON value against the schema, inserting defaults for absent
    /// fields that declare one.
    pub fn check_value_and_amend_if_need(
        &self,
        source: ValueSource,
        value: &mut ValueObject,
    ) -> SchemaResult<ValueCheckResult> {
        if self.schema_type() != SchemaType::Json {
            return Err(SchemaError::NotPermit("value check needs a json schema".into()));
        }
        let lacking = json::check_value(&self.parts, value).inspect_err(|e| {
            warn!(?source, error = %e, "value does not match schema");
        })?;
        let mut amended = false;
        for path in &lacking {
            let Some(attr) = self.parts.define.get(path) else {
                continue;
            };
            let Some(default) = &attr.default_value else {
                continue;
            };
            value
                .insert_field(path, attr.field_type, default)
                .map_err(|e| SchemaError::internal(format!("amend {path}: {e}")))?;
            amended = true;
        }
        Ok(if amended {
            ValueCheckResult::MatchAmended
        } else {
            ValueCheckResult::Match
        })
    }

    /// Verifies a FlatBuffer value (including its skip prefix).
    pub fn verify_value(&self, source: ValueSource, value: &[u8]) -> SchemaResult<()> {
        let SchemaVariant::FlatBuffer { reflection, .. } = &self.variant else {
            return Err(SchemaError::NotPermit("verify needs a flatbuffer schema".into()));
        };
        let body = self.strip_skip(value)?;
        flatbuffer::verify_value(reflection, body).inspect_err(|e| {
            warn!(?source, error = %e, "flatbuffer value verify failed");
        })
    }

    /// Extracts the root field named by `path` (`$.name`) from a FlatBuffer
    /// value. Absent fields yield the schema default.
    pub fn extract_value(
        &self,
        source: ValueSource,
        path: &str,
        value: &[u8],
    ) -> SchemaResult<FieldValue> {
        let SchemaVariant::FlatBuffer { reflection, .. } = &self.variant else {
            return Err(SchemaError::NotPermit("extract needs a flatbuffer schema".into()));
        };
        let body = self.strip_skip(value)?;
        flatbuffer::extract_value(reflection, path, body).inspect_err(|e| {
            warn!(?source, path, error = %e, "flatbuffer extract failed");
        })
    }

    fn strip_skip<'v>(&self, value: &'v [u8]) -> SchemaResult<&'v [u8]> {
        let skip = usize::try_from(self.parts.skip_size).map_err(SchemaError::internal)?;
        if value.len() <= skip {
            return Err(SchemaError::FlatBufferVerifyFail(format!(
                "value of {} bytes within skip size {skip}",
                value.len()
            )));
        }
        Ok(&value[skip..])
    }
}

fn compare_indexes(
    old: &BTreeMap<IndexName, IndexInfo>,
    new: &BTreeMap<IndexName, IndexInfo>,
) -> IndexDifference {
    let mut difference = IndexDifference::default();
    for (name, info) in new {
        match old.get(name) {
            None => {
                debug!(index = %name, "index added");
                difference.increase.insert(name.clone(), info.clone());
            }
            Some(old_info) if old_info != info => {
                debug!(index = %name, "index changed");
                difference.change.insert(name.clone(), info.clone());
            }
            Some(_) => {}
        }
    }
    difference.decrease = old
        .keys()
        .filter(|name| !new.contains_key(*name))
        .cloned()
        .collect::<BTreeSet<_>>();
    difference
}
