//! Operator CLI: inspect and compare schemas, upgrade databases, and show
//! the SQL a query compiles to.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use kvschema_core::query::{Query, QueryObject};
use kvschema_core::{SchemaObject, SchemaResult};
use kvschema_storage::{SchemaStore, StorageConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "kvschema", version, about)]
struct Cli {
    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, env = "KVSCHEMA_LOG", default_value = "warn", global = true)]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a schema and print its structure.
    Inspect { schema: PathBuf },
    /// Compare two schemas, old first.
    Compare { old: PathBuf, new: PathBuf },
    /// Open a database and upgrade it to a schema.
    Upgrade {
        #[arg(long, env = "KVSCHEMA_DB")]
        db: PathBuf,
        #[arg(long)]
        schema: PathBuf,
    },
    /// Compile a JSON query description against a schema.
    QuerySql {
        #[arg(long)]
        schema: PathBuf,
        /// Query as JSON, e.g. `{"nodes":[{"op":"equal_to","field":"a","values":[1]}]}`.
        #[arg(long)]
        query: String,
    },
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Parses schema file contents. The bytes are tried untouched first, since
/// a raw `.bfbs` may begin or end with whitespace bytes; text schemas are
/// retried without surrounding whitespace.
fn parse_schema_bytes(raw: &[u8]) -> SchemaResult<SchemaObject> {
    SchemaObject::parse(raw).or_else(|err| {
        let trimmed = raw.trim_ascii();
        if trimmed.len() == raw.len() {
            return Err(err);
        }
        SchemaObject::parse(trimmed)
    })
}

/// Reads a schema file. FlatBuffer schemas may be given as raw `.bfbs`
/// bytes or as Base64 text.
fn read_schema(path: &Path) -> anyhow::Result<SchemaObject> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_schema_bytes(&raw).with_context(|| format!("parsing schema {}", path.display()))
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let schema = read_schema(path)?;
    println!("type:      {}", schema.schema_type());
    println!("mode:      {}", schema.mode());
    println!("skip size: {}", schema.skip_size());
    if !schema.description().is_empty() {
        println!("described: {}", schema.description());
    }
    println!("indexes:   {}", serde_json::to_string(schema.indexes())?);
    println!("define:    {}", serde_json::to_string_pretty(schema.define())?);
    Ok(())
}

fn compare(old: &Path, new: &Path) -> anyhow::Result<()> {
    let old = read_schema(old)?;
    let new = read_schema(new)?;
    let (result, difference) = old.compare_against_schema_object(&new)?;
    println!("result:     {result}");
    if !result.is_incompatible() {
        println!("difference: {}", serde_json::to_string_pretty(&difference)?);
    }
    Ok(())
}

fn upgrade(db: &Path, schema_path: &Path) -> anyhow::Result<()> {
    // Canonical JSON, or Base64 for a FlatBuffer schema read as raw bytes.
    let text = read_schema(schema_path)?.to_schema_string();
    let store = SchemaStore::open(&StorageConfig::at(db))
        .with_context(|| format!("opening {}", db.display()))?;
    let report = store.upgrade_schema(&text)?;
    info!(?report, "upgrade done");
    println!("{report:?}");
    Ok(())
}

fn query_sql(schema_path: &Path, query: &str) -> anyhow::Result<()> {
    let schema = read_schema(schema_path)?;
    let query: Query = serde_json::from_str(query).context("parsing query json")?;
    let mut object = QueryObject::new(query).with_schema(&schema);
    println!("query: {}", object.query_sql(false)?);
    println!("args:  {:?}", object.bind_args()?);
    let count = object.count_sql()?;
    if object.is_count_valid() {
        println!("count: {count}");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);
    match cli.command {
        Command::Inspect { schema } => inspect(&schema),
        Command::Compare { old, new } => compare(&old, &new),
        Command::Upgrade { db, schema } => upgrade(&db, &schema),
        Command::QuerySql { schema, query } => query_sql(&schema, &query),
    }
}

#[cfg(test)]
mod tests {
    use kvschema_core::bfbs::testkit::{FieldSpec, ObjectSpec, SchemaSpec};
    use kvschema_core::bfbs::BaseType;
    use kvschema_core::SchemaType;

    use super::*;

    /// A ten-field schema binary whose size prefix starts with a space byte.
    /// Growing the root name by four bytes grows the binary by four, so one
    /// of 64 lengths lands on every low byte.
    fn space_led_binary() -> Vec<u8> {
        (0..64)
            .map(|k| {
                let mut root = ObjectSpec::versioned_root(&"T".repeat(1 + 4 * k));
                for id in 0..10u16 {
                    root = root.field(FieldSpec::scalar(&format!("f{id}"), BaseType::Int, id));
                }
                SchemaSpec::new(root).build()
            })
            .find(|bytes| bytes[0] == b' ')
            .unwrap()
    }

    #[test]
    fn raw_binary_is_parsed_untrimmed() {
        let bytes = space_led_binary();
        assert!(SchemaObject::parse(bytes.trim_ascii()).is_err());
        let schema = parse_schema_bytes(&bytes).unwrap();
        assert_eq!(schema.schema_type(), SchemaType::FlatBuffer);
        assert_eq!(schema.define().field_count(), 10);
        assert_eq!(schema.schema_bytes(), bytes);
    }

    #[test]
    fn text_schemas_tolerate_surrounding_whitespace() {
        let json = "\n {\"SCHEMA_VERSION\":\"1.0\",\"SCHEMA_MODE\":\"STRICT\",\"SCHEMA_DEFINE\":{\"a\":\"INTEGER\"}}\r\n";
        assert_eq!(parse_schema_bytes(json.as_bytes()).unwrap().schema_type(), SchemaType::Json);

        let base64 = SchemaSpec::new(
            ObjectSpec::versioned_root("Root").field(FieldSpec::scalar("a", BaseType::Int, 0)),
        )
        .build_base64();
        let base64 = format!("{base64}\n");
        let schema = parse_schema_bytes(base64.as_bytes()).unwrap();
        assert_eq!(schema.schema_type(), SchemaType::FlatBuffer);
        assert!(parse_schema_bytes(b"  not a schema \n").is_err());
    }
}
