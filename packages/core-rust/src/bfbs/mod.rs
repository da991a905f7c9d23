//! Binary FlatBuffer schema support: verified access, the reflection
//! decoder, and detection of raw or Base64-wrapped schema binaries.

pub mod access;
pub mod reflection;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

use base64::Engine as _;
use tracing::debug;

pub use reflection::{BaseType, ReflectionField, ReflectionObject, ReflectionSchema, ReflectionType};

use crate::limits::SCHEMA_STRING_SIZE_LIMIT;

/// Returns the raw schema binary if `input` is a size-prefixed `.bfbs`,
/// either verbatim or Base64 encoded.
#[must_use]
pub fn detect_schema_binary(input: &[u8]) -> Option<Vec<u8>> {
    // Base64 never more than doubles the binary.
    if input.is_empty() || input.len() >= SCHEMA_STRING_SIZE_LIMIT * 2 {
        return None;
    }
    if ReflectionSchema::decode_size_prefixed(input).is_ok() {
        return Some(input.to_vec());
    }
    let compact: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .ok()?;
    debug!(decoded = decoded.len(), original = input.len(), "base64 decoded schema");
    if decoded.is_empty() || decoded.len() >= input.len() {
        return None;
    }
    ReflectionSchema::decode_size_prefixed(&decoded)
        .is_ok()
        .then_some(decoded)
}

#[cfg(test)]
mod tests {
    use super::testkit::{FieldSpec, ObjectSpec, SchemaSpec};
    use super::*;

    fn spec() -> SchemaSpec {
        SchemaSpec::new(
            ObjectSpec::versioned_root("Root").field(FieldSpec::scalar("a", BaseType::Int, 0)),
        )
    }

    #[test]
    fn detects_raw_and_base64() {
        let raw = spec().build();
        assert_eq!(detect_schema_binary(&raw), Some(raw.clone()));
        let encoded = spec().build_base64();
        assert_eq!(detect_schema_binary(encoded.as_bytes()), Some(raw));
    }

    #[test]
    fn rejects_json_and_empty() {
        assert!(detect_schema_binary(b"").is_none());
        assert!(detect_schema_binary(br#"{"SCHEMA_VERSION":"1.0"}"#).is_none());
        assert!(detect_schema_binary(b"aGVsbG8=").is_none());
    }
}
