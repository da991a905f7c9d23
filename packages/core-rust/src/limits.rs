//! Fixed limits of the schema language, value format, and query compiler.

/// Maximum size in bytes of a (decoded) schema.
pub const SCHEMA_STRING_SIZE_LIMIT: usize = 512 * 1024;
/// Maximum size in bytes of a STRING default value.
pub const SCHEMA_DEFAULT_STRING_SIZE_LIMIT: usize = 4096;
pub const SCHEMA_FIELD_NAME_LENGTH_MAX: usize = 64;
/// Maximum number of segments in a field path.
pub const SCHEMA_FIELD_PATH_DEPTH_MAX: usize = 4;
/// Maximum number of field paths across all depths of a define.
pub const SCHEMA_FIELD_NAME_COUNT_MAX: usize = 256;
pub const SCHEMA_INDEX_COUNT_MAX: usize = 32;
pub const SCHEMA_SKIPSIZE_MAX: u32 = 4_194_302;
pub const SCHEMA_META_FIELD_COUNT_MIN: usize = 3;
pub const SCHEMA_META_FIELD_COUNT_MAX: usize = 5;
/// The only schema version understood by this implementation.
pub const SCHEMA_SUPPORT_VERSION: &str = "1.0";

pub const MAX_KEY_SIZE: usize = 1024;
pub const MAX_VALUE_SIZE: usize = 4 * 1024 * 1024;
/// Maximum combined object/array nesting accepted by the JSON value parser.
pub const JSON_MAX_NEST_DEPTH: usize = 100;

// ---------------------------------------------------------------------------
// Schema keywords
// ---------------------------------------------------------------------------

pub const KEYWORD_SCHEMA_VERSION: &str = "SCHEMA_VERSION";
pub const KEYWORD_SCHEMA_MODE: &str = "SCHEMA_MODE";
pub const KEYWORD_SCHEMA_DEFINE: &str = "SCHEMA_DEFINE";
pub const KEYWORD_SCHEMA_INDEXES: &str = "SCHEMA_INDEXES";
pub const KEYWORD_SCHEMA_SKIPSIZE: &str = "SCHEMA_SKIPSIZE";
pub const KEYWORD_MODE_STRICT: &str = "STRICT";
pub const KEYWORD_MODE_COMPATIBLE: &str = "COMPATIBLE";
/// Per-field FlatBuffer attribute declaring an index.
pub const KEYWORD_INDEX: &str = "INDEX";
