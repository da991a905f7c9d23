//! Moves a database from its stored schema to a new one.
//!
//! The upgrade compares the two schemas, amends stored values when the new
//! schema adds defaults, then rebuilds indexes in the order
//! decrease → change → increase so the index count never peaks above the
//! larger of the two schemas.

use kvschema_core::types::IndexDifference;
use kvschema_core::{SchemaCompareResult, SchemaError, SchemaObject};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::traits::SchemaStorage;

/// What an upgrade did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Stored-versus-new comparison; `None` when the database was plain KV.
    pub compare: Option<SchemaCompareResult>,
    /// Rows rewritten by value amendment.
    pub rewritten: usize,
    pub indexes_dropped: usize,
    pub indexes_changed: usize,
    pub indexes_created: usize,
}

impl UpgradeReport {
    /// `true` when nothing in the database had to change.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.compare == Some(SchemaCompareResult::EqualExactly)
    }
}

/// Drives a schema upgrade over any [`SchemaStorage`].
///
/// The upgrader issues no transaction statements of its own; callers wrap
/// [`upgrade`](Self::upgrade) in one so a failure leaves the database as
/// it was.
pub struct SchemaUpgrader<'s, S: SchemaStorage + ?Sized> {
    storage: &'s S,
}

impl<'s, S: SchemaStorage + ?Sized> SchemaUpgrader<'s, S> {
    #[must_use]
    pub fn new(storage: &'s S) -> Self {
        Self { storage }
    }

    /// Upgrades the database to `new`.
    ///
    /// # Errors
    ///
    /// [`StorageError::SchemaIncompatible`] when `new` cannot replace the
    /// stored schema, [`StorageError::ValueViolation`] when a stored value
    /// fails the new schema. The caller owns the surrounding transaction.
    pub fn upgrade(&self, new: &SchemaObject) -> StorageResult<UpgradeReport> {
        if !new.is_valid() {
            return Err(SchemaError::InvalidArgs("upgrade target has no schema".into()).into());
        }
        let Some(old) = self.storage.get_schema()? else {
            return self.upgrade_from_kv(new);
        };
        let (result, difference) = old.compare_against_schema_object(new)?;
        info!(%result, "schema upgrade started");
        let mut report = UpgradeReport {
            compare: Some(result),
            ..UpgradeReport::default()
        };
        match result {
            SchemaCompareResult::UnequalIncompatible => {
                warn!("new schema is incompatible with the stored one");
                return Err(StorageError::SchemaIncompatible);
            }
            SchemaCompareResult::EqualExactly => {
                debug!("schema unchanged");
                return Ok(report);
            }
            SchemaCompareResult::UnequalCompatibleUpgrade => {
                report.rewritten = self.storage.upgrade_values(new)?;
            }
            SchemaCompareResult::UnequalCompatible => {}
        }
        self.apply_index_difference(new, &difference, &mut report)?;
        self.storage.save_schema(new)?;
        info!(rewritten = report.rewritten, "schema upgrade finished");
        Ok(report)
    }

    /// Every live row is checked (and amended) before the schema is saved;
    /// all declared indexes are created.
    fn upgrade_from_kv(&self, new: &SchemaObject) -> StorageResult<UpgradeReport> {
        info!(schema_type = %new.schema_type(), "upgrading kv database to schema");
        let mut report = UpgradeReport {
            rewritten: self.storage.upgrade_values(new)?,
            ..UpgradeReport::default()
        };
        let difference = IndexDifference {
            increase: new.indexes().clone(),
            ..IndexDifference::default()
        };
        self.apply_index_difference(new, &difference, &mut report)?;
        self.storage.save_schema(new)?;
        info!(rewritten = report.rewritten, "schema upgrade finished");
        Ok(report)
    }

    fn apply_index_difference(
        &self,
        new: &SchemaObject,
        difference: &IndexDifference,
        report: &mut UpgradeReport,
    ) -> StorageResult<()> {
        let (schema_type, skip_size) = (new.schema_type(), new.skip_size());
        for name in &difference.decrease {
            self.storage.decrease_index(name)?;
            report.indexes_dropped += 1;
        }
        for (name, info) in &difference.change {
            self.storage.change_index(name, info, schema_type, skip_size)?;
            report.indexes_changed += 1;
        }
        for (name, info) in &difference.increase {
            self.storage.increase_index(name, info, schema_type, skip_size)?;
            report.indexes_created += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use kvschema_core::types::{IndexInfo, IndexName};
    use kvschema_core::SchemaType;

    use super::*;

    /// Records every call instead of touching a database.
    #[derive(Default)]
    struct RecordingStorage {
        stored: RefCell<Option<SchemaObject>>,
        calls: RefCell<Vec<String>>,
        violate: bool,
    }

    impl RecordingStorage {
        fn with_schema(schema: &str) -> Self {
            Self {
                stored: RefCell::new(Some(SchemaObject::parse(schema).unwrap())),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl SchemaStorage for RecordingStorage {
        fn get_schema(&self) -> StorageResult<Option<SchemaObject>> {
            Ok(self.stored.borrow().clone())
        }

        fn save_schema(&self, schema: &SchemaObject) -> StorageResult<()> {
            self.calls.borrow_mut().push("save".into());
            *self.stored.borrow_mut() = Some(schema.clone());
            Ok(())
        }

        fn increase_index(
            &self,
            name: &IndexName,
            _info: &IndexInfo,
            _schema_type: SchemaType,
            _skip_size: u32,
        ) -> StorageResult<()> {
            self.calls.borrow_mut().push(format!("increase {name}"));
            Ok(())
        }

        fn decrease_index(&self, name: &IndexName) -> StorageResult<()> {
            self.calls.borrow_mut().push(format!("decrease {name}"));
            Ok(())
        }

        fn upgrade_values(&self, _schema: &SchemaObject) -> StorageResult<usize> {
            if self.violate {
                return Err(StorageError::ValueViolation("$.a".into()));
            }
            self.calls.borrow_mut().push("values".into());
            Ok(2)
        }
    }

    fn schema(define: &str, indexes: &str) -> String {
        format!(
            r#"{{"SCHEMA_VERSION":"1.0","SCHEMA_MODE":"COMPATIBLE","SCHEMA_DEFINE":{{{define}}},"SCHEMA_INDEXES":[{indexes}]}}"#
        )
    }

    #[test]
    fn kv_to_schema_checks_values_then_indexes_then_saves() {
        let storage = RecordingStorage::default();
        let new = SchemaObject::parse(schema(r#""a":"INTEGER","b":"LONG""#, r#""a","b""#)).unwrap();
        let report = SchemaUpgrader::new(&storage).upgrade(&new).unwrap();
        assert_eq!(report.compare, None);
        assert_eq!(report.rewritten, 2);
        assert_eq!(report.indexes_created, 2);
        assert_eq!(
            storage.calls(),
            vec!["values", "increase $.a", "increase $.b", "save"]
        );
    }

    #[test]
    fn index_changes_run_decrease_change_increase() {
        let storage = RecordingStorage::with_schema(&schema(
            r#""a":"INTEGER","b":"LONG","c":"STRING""#,
            r#""a",["b","c"]"#,
        ));
        let new = SchemaObject::parse(schema(
            r#""a":"INTEGER","b":"LONG","c":"STRING""#,
            r#"["b","a"],"c""#,
        ))
        .unwrap();
        let report = SchemaUpgrader::new(&storage).upgrade(&new).unwrap();
        assert_eq!(report.compare, Some(SchemaCompareResult::UnequalCompatible));
        assert_eq!(report.rewritten, 0);
        assert_eq!(
            storage.calls(),
            vec![
                "decrease $.a",
                "decrease $.b",
                "increase $.b",
                "increase $.c",
                "save",
            ]
        );
    }

    #[test]
    fn compatible_upgrade_amends_values() {
        let storage = RecordingStorage::with_schema(&schema(r#""a":"INTEGER""#, ""));
        let new =
            SchemaObject::parse(schema(r#""a":"INTEGER","b":"STRING, DEFAULT 'x'""#, "")).unwrap();
        let report = SchemaUpgrader::new(&storage).upgrade(&new).unwrap();
        assert_eq!(report.compare, Some(SchemaCompareResult::UnequalCompatibleUpgrade));
        assert_eq!(storage.calls(), vec!["values", "save"]);
    }

    #[test]
    fn equal_schema_is_a_noop() {
        let text = schema(r#""a":"INTEGER""#, r#""a""#);
        let storage = RecordingStorage::with_schema(&text);
        let report = SchemaUpgrader::new(&storage)
            .upgrade(&SchemaObject::parse(&text).unwrap())
            .unwrap();
        assert!(report.is_noop());
        assert!(storage.calls().is_empty());
    }

    #[test]
    fn incompatible_and_violating_upgrades_fail() {
        let storage = RecordingStorage::with_schema(&schema(r#""a":"INTEGER","b":"LONG""#, ""));
        let reduced = SchemaObject::parse(schema(r#""a":"INTEGER""#, "")).unwrap();
        assert!(matches!(
            SchemaUpgrader::new(&storage).upgrade(&reduced),
            Err(StorageError::SchemaIncompatible)
        ));

        let storage = RecordingStorage {
            violate: true,
            ..RecordingStorage::default()
        };
        assert!(matches!(
            SchemaUpgrader::new(&storage).upgrade(&reduced),
            Err(StorageError::ValueViolation(_))
        ));
        assert!(storage.calls().is_empty());

        assert!(SchemaUpgrader::new(&storage)
            .upgrade(&SchemaObject::default())
            .is_err());
    }
}
