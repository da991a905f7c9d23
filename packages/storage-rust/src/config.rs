//! Storage configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// `SQLite` journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    /// Value for `PRAGMA journal_mode`.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Full,
    Normal,
}

impl SyncMode {
    /// Value for `PRAGMA synchronous`.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration of a [`SchemaStore`](crate::SchemaStore).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    pub journal_mode: JournalMode,
    pub sync_mode: SyncMode,
    /// Create the database file when it does not exist.
    pub create_if_missing: bool,
    /// Schema the database is opened (and upgraded) with. `None` keeps the
    /// stored schema, or opens a plain KV database.
    pub schema: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: JournalMode::default(),
            sync_mode: SyncMode::default(),
            create_if_missing: true,
            schema: None,
        }
    }
}

impl StorageConfig {
    /// An on-disk database at `path` with default settings.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StorageConfig::default();
        assert!(config.path.is_none());
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.journal_mode, JournalMode::Wal);
        assert_eq!(config.sync_mode, SyncMode::Full);
        assert!(config.create_if_missing);
        assert!(config.schema.is_none());
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"path":"/tmp/kv.db","journal_mode":"delete","sync_mode":"normal"}"#,
        )
        .unwrap();
        assert_eq!(config.path, Some(PathBuf::from("/tmp/kv.db")));
        assert_eq!(config.journal_mode.pragma_value(), "delete");
        assert_eq!(config.sync_mode.pragma_value(), "normal");
        assert_eq!(config.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
    }

    #[test]
    fn builder_helpers() {
        let config = StorageConfig::at("a.db").with_schema("{}");
        assert_eq!(config.path, Some(PathBuf::from("a.db")));
        assert_eq!(config.schema.as_deref(), Some("{}"));
    }
}
