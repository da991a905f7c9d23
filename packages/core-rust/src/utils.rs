//! Stateless parsing and formatting helpers for the schema language.
//!
//! Field paths (`$.a.b`), field names, and attribute strings of the form
//! `TYPE[, NOT NULL][, DEFAULT <value>]` are validated here. The attribute
//! grammar is recognized by a small table-driven automaton.

use tracing::{debug, warn};

use crate::error::{SchemaError, SchemaResult};
use crate::limits::{
    SCHEMA_DEFAULT_STRING_SIZE_LIMIT, SCHEMA_FIELD_NAME_LENGTH_MAX, SCHEMA_FIELD_PATH_DEPTH_MAX,
};
use crate::types::{FieldPath, FieldType, FieldValue, SchemaAttribute, SchemaType};

const KEYWORD_NOT_NULL: &str = "NOT NULL";
const KEYWORD_DEFAULT: &str = "DEFAULT";
const KEYWORD_NULL: &str = "null";
const TRIM_CHARS: [char; 3] = ['\r', '\t', ' '];

pub const JSON_EXTRACT_FUNC_NAME: &str = "json_extract_by_path";
pub const FLATBUFFER_EXTRACT_FUNC_NAME: &str = "flatbuffer_extract_by_path";

/// Trims carriage returns, tabs, and spaces from both ends.
#[must_use]
pub fn strip(input: &str) -> &str {
    input.trim_matches(&TRIM_CHARS[..])
}

/// Returns the part of a fully qualified name after the last `.`.
#[must_use]
pub fn strip_name_space(full_name: &str) -> &str {
    full_name.rsplit('.').next().unwrap_or(full_name)
}

/// Validates a single field name: 1..=64 ASCII alphanumerics or `_`, not
/// starting with a digit.
pub fn check_field_name(name: &str) -> SchemaResult<()> {
    if name.is_empty() || name.len() > SCHEMA_FIELD_NAME_LENGTH_MAX {
        return Err(SchemaError::parse(format!(
            "field name length {} out of range",
            name.len()
        )));
    }
    let bytes = name.as_bytes();
    if !(bytes[0].is_ascii_alphabetic() || bytes[0] == b'_') {
        return Err(SchemaError::parse(format!(
            "field name {name:?} must begin with a letter or underscore"
        )));
    }
    if !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_') {
        return Err(SchemaError::parse(format!(
            "field name {name:?} contains an unsupported character"
        )));
    }
    Ok(())
}

/// Reports whether `input` starts with `$.`, rejecting malformed prefixes.
fn check_dollar_dot_prefix(input: &str) -> SchemaResult<bool> {
    let bytes = input.as_bytes();
    if bytes.is_empty() {
        return Err(SchemaError::parse("empty field path"));
    }
    if bytes.len() >= 2 {
        if bytes[0] == b'$' && bytes[1] == b'.' {
            return Ok(true);
        }
        if bytes[0] == b'$' || bytes[1] == b'$' {
            return Err(SchemaError::parse(format!("malformed path prefix in {input:?}")));
        }
    }
    if bytes[0] == b'.' {
        return Err(SchemaError::parse(format!("path {input:?} begins with a dot")));
    }
    Ok(false)
}

/// Parses `a.b.c` or `$.a.b.c` into a [`FieldPath`], validating depth and
/// every segment name.
pub fn parse_and_check_field_path(input: &str) -> SchemaResult<FieldPath> {
    let trimmed = strip(input);
    let has_prefix = check_dollar_dot_prefix(trimmed)?;
    let body = if has_prefix { &trimmed[2..] } else { trimmed };
    if body.is_empty() || body.ends_with('.') {
        return Err(SchemaError::parse(format!(
            "dot at end of path {input:?} leaves an empty segment"
        )));
    }
    let segments: Vec<&str> = body.split('.').collect();
    if segments.len() > SCHEMA_FIELD_PATH_DEPTH_MAX {
        return Err(SchemaError::parse(format!(
            "path {input:?} deeper than {SCHEMA_FIELD_PATH_DEPTH_MAX}"
        )));
    }
    for segment in &segments {
        check_field_name(segment)?;
    }
    Ok(FieldPath::new(segments))
}

// ---------------------------------------------------------------------------
// Attribute automaton
// ---------------------------------------------------------------------------

/// Input classes of the attribute automaton, in table column order.
#[derive(Debug, Clone, Copy)]
enum Token {
    Blank = 0,
    NotNull = 1,
    Default = 2,
    Other = 3,
    Comma = 4,
}

const STATE_ILLEGAL: i8 = -1;

// Rows are states:
// 0 empty, 1 type, 2 "type,", 3 "type, NOT NULL", 4 "type, NOT NULL,",
// 5 "... DEFAULT", 6 "... DEFAULT ", 7 default value (absorbing).
const STATE_TRANSFER: [[i8; 5]; 8] = [
    [0, -1, -1, 1, -1],
    [1, -1, -1, 1, 2],
    [2, 3, 5, -1, -1],
    [3, -1, -1, -1, 4],
    [4, -1, 5, -1, -1],
    [6, -1, -1, -1, -1],
    [6, -1, -1, 7, -1],
    [7, 7, 7, 7, 7],
];

/// Classifies the byte at `*pos`; keyword matches advance `pos` to the last
/// byte of the keyword.
fn classify(input: &[u8], pos: &mut usize) -> Option<Token> {
    let byte = input[*pos];
    let rest = &input[*pos..];
    if byte.is_ascii_whitespace() || byte == 0x0b {
        Some(Token::Blank)
    } else if rest.starts_with(KEYWORD_NOT_NULL.as_bytes()) {
        *pos += KEYWORD_NOT_NULL.len() - 1;
        Some(Token::NotNull)
    } else if rest.starts_with(KEYWORD_DEFAULT.as_bytes()) {
        *pos += KEYWORD_DEFAULT.len() - 1;
        Some(Token::Default)
    } else if byte.is_ascii_alphanumeric() || matches!(byte, b'\'' | b'+' | b'-') {
        Some(Token::Other)
    } else if byte == b',' {
        Some(Token::Comma)
    } else {
        None
    }
}

/// Raw pieces of an attribute string before type-directed interpretation.
#[derive(Debug, Default)]
struct AttributeParts {
    type_name: String,
    not_null: bool,
    default_text: Option<String>,
}

fn split_schema_attribute(input: &str) -> SchemaResult<AttributeParts> {
    let bytes = input.as_bytes();
    let mut parts = AttributeParts::default();
    let mut state: i8 = 0;
    let mut pos = 0;
    while pos < bytes.len() {
        let Some(token) = classify(bytes, &mut pos) else {
            return Err(SchemaError::parse(format!(
                "unrecognized character {:?} in attribute",
                char::from(bytes[pos])
            )));
        };
        // state is never negative here: illegal transitions return below.
        state = STATE_TRANSFER[usize::try_from(state).unwrap_or_default()][token as usize];
        match state {
            STATE_ILLEGAL => {
                return Err(SchemaError::parse(format!(
                    "attribute {input:?} is not of the form TYPE[, NOT NULL][, DEFAULT x]"
                )));
            }
            1 => parts.type_name.push(char::from(bytes[pos])),
            3 => parts.not_null = true,
            7 => {
                // Entering state 7 always follows at least one blank.
                parts.default_text = Some(input[pos - 1..].to_string());
                break;
            }
            _ => {}
        }
        pos += 1;
    }
    if !matches!(state, 1 | 3 | 7) {
        return Err(SchemaError::parse(format!(
            "attribute {input:?} ends in an incomplete clause"
        )));
    }
    Ok(parts)
}

fn field_type_from_keyword(keyword: &str) -> Option<FieldType> {
    match keyword {
        "BOOL" => Some(FieldType::Bool),
        "INTEGER" => Some(FieldType::Integer),
        "LONG" => Some(FieldType::Long),
        "DOUBLE" => Some(FieldType::Double),
        "STRING" => Some(FieldType::String),
        _ => None,
    }
}

/// Parses `s` the way C `atoi`/`atoll` would (optional single sign, then the
/// leading digit run) and then requires the digits to round-trip exactly, so
/// `"007"`, `"1x"` and overflow are all rejected.
pub(crate) fn parse_integer_round_trip(text: &str) -> Option<i64> {
    let bytes = text.as_bytes();
    let (negative, unsigned) = match bytes.first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    let digit_len = unsigned.bytes().take_while(u8::is_ascii_digit).count();
    let digits = &unsigned[..digit_len];
    let magnitude: i128 = if digits.is_empty() { 0 } else { digits.parse().ok()? };
    let value = i64::try_from(if negative { -magnitude } else { magnitude }).ok()?;

    let review = value.to_string();
    let sign_chars: &[char] = &['+', '-', ' '];
    if text.trim_start_matches(sign_chars) != review.trim_start_matches(sign_chars) {
        return None;
    }
    let sign_agrees = (text.starts_with('-') == review.starts_with('-')) || value == 0;
    sign_agrees.then_some(value)
}

fn transform_double(text: &str) -> Option<f64> {
    if text.is_empty()
        || !text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'+' | b'-'))
        || text.bytes().filter(|b| *b == b'.').count() > 1
    {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn transform_default_value(raw: &str, field_type: FieldType) -> SchemaResult<FieldValue> {
    let fail = || SchemaError::parse(format!("default {raw:?} is not a valid {field_type}"));
    let value = match field_type {
        FieldType::Bool => match raw {
            "true" => FieldValue::Bool(true),
            "false" => FieldValue::Bool(false),
            _ => return Err(fail()),
        },
        FieldType::Integer => {
            let value = parse_integer_round_trip(raw).ok_or_else(fail)?;
            FieldValue::Integer(i32::try_from(value).map_err(|_| fail())?)
        }
        FieldType::Long => FieldValue::Long(parse_integer_round_trip(raw).ok_or_else(fail)?),
        FieldType::Double => FieldValue::Double(transform_double(raw).ok_or_else(fail)?),
        FieldType::String => {
            if raw.len() < 2 || !raw.starts_with('\'') || !raw.ends_with('\'') {
                return Err(fail());
            }
            let inner = &raw[1..raw.len() - 1];
            if inner.len() > SCHEMA_DEFAULT_STRING_SIZE_LIMIT {
                return Err(SchemaError::parse(format!(
                    "string default longer than {SCHEMA_DEFAULT_STRING_SIZE_LIMIT} bytes"
                )));
            }
            FieldValue::String(inner.to_string())
        }
        _ => return Err(fail()),
    };
    Ok(value)
}

/// Parses an attribute string such as `"INTEGER, NOT NULL, DEFAULT 10"`.
///
/// The returned attribute is not marked indexable; callers decide that
/// from the field's position.
pub fn parse_and_check_schema_attribute(input: &str) -> SchemaResult<SchemaAttribute> {
    if input.is_empty() {
        return Err(SchemaError::parse("empty attribute"));
    }
    let parts = split_schema_attribute(input)?;
    let type_name = strip(&parts.type_name);
    let field_type = field_type_from_keyword(type_name).ok_or_else(|| {
        warn!(type_name, "unsupported schema field type");
        SchemaError::parse(format!("unsupported field type {type_name:?}"))
    })?;

    let mut attr = SchemaAttribute {
        field_type,
        is_indexable: false,
        not_null: parts.not_null,
        default_value: None,
    };
    if let Some(raw) = parts.default_text {
        let raw = strip(&raw);
        if raw == KEYWORD_NULL {
            if attr.not_null {
                return Err(SchemaError::parse("NOT NULL conflicts with DEFAULT null"));
            }
        } else {
            attr.default_value = Some(transform_default_value(raw, field_type)?);
        }
    }
    debug!(%field_type, not_null = attr.not_null, has_default = attr.has_default_value(), "parsed attribute");
    Ok(attr)
}

// ---------------------------------------------------------------------------
// SQL generation
// ---------------------------------------------------------------------------

/// Name of the SQL function that extracts a field for the given schema type.
#[must_use]
pub fn extract_func_name(schema_type: SchemaType) -> &'static str {
    if schema_type == SchemaType::Json {
        JSON_EXTRACT_FUNC_NAME
    } else {
        FLATBUFFER_EXTRACT_FUNC_NAME
    }
}

fn sqlite_cast_type(field_type: FieldType) -> Option<&'static str> {
    match field_type {
        FieldType::Bool | FieldType::Integer | FieldType::Long => Some("INT"),
        FieldType::Double => Some("REAL"),
        FieldType::String => Some("TEXT"),
        _ => None,
    }
}

/// Builds ` CAST(<extract>(value, '<path>', <skip>) AS <type>) `, padded with
/// a blank on each side. Returns an empty string for the root path or a
/// non-scalar type.
#[must_use]
pub fn generate_extract_sql(
    schema_type: SchemaType,
    path: &FieldPath,
    field_type: FieldType,
    skip_size: u32,
) -> String {
    if path.is_empty() {
        warn!("cannot generate extract sql for the root path");
        return String::new();
    }
    let Some(cast) = sqlite_cast_type(field_type) else {
        warn!(%field_type, "field type has no sql cast");
        return String::new();
    };
    format!(
        " CAST({}(value, '{path}', {skip_size}) AS {cast}) ",
        extract_func_name(schema_type)
    )
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn attr(input: &str) -> SchemaResult<SchemaAttribute> {
        parse_and_check_schema_attribute(input)
    }

    #[test]
    fn field_name_rules() {
        assert!(check_field_name("_a1").is_ok());
        assert!(check_field_name("A").is_ok());
        assert!(check_field_name("").is_err());
        assert!(check_field_name("1a").is_err());
        assert!(check_field_name("a-b").is_err());
        assert!(check_field_name(&"x".repeat(64)).is_ok());
        assert!(check_field_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn field_path_with_and_without_prefix() {
        let expected = FieldPath::new(["a", "b"]);
        assert_eq!(parse_and_check_field_path("$.a.b").unwrap(), expected);
        assert_eq!(parse_and_check_field_path(" a.b\t").unwrap(), expected);
    }

    #[test]
    fn field_path_rejections() {
        for bad in ["", "$", "$.", "a.", ".a", "a..b", "$a", "a$", "$.a.b.c.d.e", "a.1b"] {
            assert!(parse_and_check_field_path(bad).is_err(), "{bad:?} should fail");
        }
        assert_eq!(parse_and_check_field_path("a.b.c.d").unwrap().len(), 4);
    }

    #[test]
    fn attribute_type_only() {
        let parsed = attr("STRING").unwrap();
        assert_eq!(parsed.field_type, FieldType::String);
        assert!(!parsed.not_null);
        assert!(parsed.default_value.is_none());
        assert!(attr("  LONG  ").is_ok());
        assert!(attr("TEXT").is_err());
        assert!(attr("").is_err());
    }

    #[test]
    fn attribute_not_null_and_default() {
        let parsed = attr("INTEGER, NOT NULL, DEFAULT 10").unwrap();
        assert!(parsed.not_null);
        assert_eq!(parsed.default_value, Some(FieldValue::Integer(10)));

        let parsed = attr("BOOL,DEFAULT true").unwrap();
        assert_eq!(parsed.default_value, Some(FieldValue::Bool(true)));
    }

    #[test]
    fn attribute_grammar_violations() {
        assert!(attr("INTEGER,").is_err());
        assert!(attr("INTEGER, DEFAULT").is_err());
        assert!(attr("INTEGER, DEFAULT 1, NOT NULL").is_err());
        assert!(attr("INTEGER NOT NULL").is_err());
        assert!(attr("INTEGER; NOT NULL").is_err());
        assert!(attr("NOT NULL, INTEGER").is_err());
    }

    #[test]
    fn attribute_null_default() {
        assert!(attr("INTEGER, NOT NULL, DEFAULT null").is_err());
        let parsed = attr("INTEGER, DEFAULT null").unwrap();
        assert!(parsed.default_value.is_none());
    }

    #[test]
    fn integer_defaults_round_trip() {
        assert_eq!(attr("INTEGER, DEFAULT +5").unwrap().default_value, Some(FieldValue::Integer(5)));
        assert_eq!(attr("INTEGER, DEFAULT -0").unwrap().default_value, Some(FieldValue::Integer(0)));
        assert_eq!(attr("INTEGER, DEFAULT -12").unwrap().default_value, Some(FieldValue::Integer(-12)));
        assert!(attr("INTEGER, DEFAULT 007").is_err());
        assert!(attr("INTEGER, DEFAULT 99999999999999999999").is_err());
        assert!(attr("INTEGER, DEFAULT 2147483648").is_err());
        assert!(attr("INTEGER, DEFAULT +-5").is_err());
        assert_eq!(
            attr("LONG, DEFAULT 2147483648").unwrap().default_value,
            Some(FieldValue::Long(2_147_483_648))
        );
    }

    #[test]
    fn double_defaults() {
        match attr("DOUBLE, DEFAULT 2.5").unwrap().default_value {
            Some(FieldValue::Double(v)) => assert!((v - 2.5).abs() < 1e-12),
            other => panic!("unexpected default {other:?}"),
        }
        assert!(attr("DOUBLE, DEFAULT 1.2.3").is_err());
        assert!(attr("DOUBLE, DEFAULT 1e5").is_err());
        assert!(attr("DOUBLE, DEFAULT -").is_err());
        assert!(attr("DOUBLE, DEFAULT .5").is_ok());
    }

    #[test]
    fn string_defaults() {
        assert_eq!(
            attr("STRING, DEFAULT 'abc'").unwrap().default_value,
            Some(FieldValue::String("abc".into()))
        );
        assert_eq!(
            attr("STRING, DEFAULT ''").unwrap().default_value,
            Some(FieldValue::String(String::new()))
        );
        assert!(attr("STRING, DEFAULT abc").is_err());
        assert!(attr("STRING, DEFAULT '").is_err());
        let long = format!("STRING, DEFAULT '{}'", "a".repeat(4097));
        assert!(attr(&long).is_err());
    }

    #[test]
    fn bool_defaults_are_exact() {
        assert!(attr("BOOL, DEFAULT TRUE").is_err());
        assert_eq!(attr("BOOL, DEFAULT false").unwrap().default_value, Some(FieldValue::Bool(false)));
    }

    #[test]
    fn strip_helpers() {
        assert_eq!(strip("\t a b \r"), "a b");
        assert_eq!(strip_name_space("com.example.Root"), "Root");
        assert_eq!(strip_name_space("Root"), "Root");
    }

    #[test]
    fn extract_sql_shapes() {
        let path = FieldPath::new(["a", "b"]);
        assert_eq!(
            generate_extract_sql(SchemaType::Json, &path, FieldType::Long, 0),
            " CAST(json_extract_by_path(value, '$.a.b', 0) AS INT) "
        );
        assert_eq!(
            generate_extract_sql(SchemaType::FlatBuffer, &path, FieldType::String, 8),
            " CAST(flatbuffer_extract_by_path(value, '$.a.b', 8) AS TEXT) "
        );
        assert!(generate_extract_sql(SchemaType::Json, &FieldPath::root(), FieldType::Bool, 0).is_empty());
        assert!(generate_extract_sql(SchemaType::Json, &path, FieldType::Array, 0).is_empty());
    }

    proptest! {
        #[test]
        fn field_name_matches_pattern(name in "[A-Za-z_][A-Za-z0-9_]{0,63}") {
            prop_assert!(check_field_name(&name).is_ok());
        }

        #[test]
        fn field_name_rejects_leading_digit(name in "[0-9][A-Za-z0-9_]{0,10}") {
            prop_assert!(check_field_name(&name).is_err());
        }

        #[test]
        fn field_path_renders_and_reparses(segments in proptest::collection::vec("[a-z_][a-z0-9_]{0,8}", 1..=4)) {
            let path = FieldPath::new(segments);
            let reparsed = parse_and_check_field_path(&path.to_string()).unwrap();
            prop_assert_eq!(reparsed, path);
        }
    }
}
