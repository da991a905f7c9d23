//! Query expression nodes and the fluent [`Query`] builder that produces
//! them.

use serde::{Deserialize, Serialize};

/// Operator of one query node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryObjType {
    EqualTo,
    NotEqualTo,
    GreaterThan,
    LessThan,
    GreaterThanOrEqualTo,
    LessThanOrEqualTo,
    Like,
    NotLike,
    IsNull,
    IsNotNull,
    In,
    NotIn,
    BeginGroup,
    EndGroup,
    And,
    Or,
    Limit,
    OrderBy,
    QueryByKeyPrefix,
    SuggestIndex,
    /// Produced by the builder for malformed input; never legal.
    Illegal,
}

/// Grammatical class of an operator, driving legality checks and SQL
/// emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolType {
    Invalid,
    Compare,
    Relational,
    Range,
    Logic,
    Link,
    /// `LIMIT` and `ORDER BY`; must trail the conditions.
    Special,
    PrefixKey,
    SuggestIndex,
}

impl SymbolType {
    /// Compare, relational, and range nodes all reference a field.
    pub(crate) fn is_condition(self) -> bool {
        matches!(self, Self::Compare | Self::Relational | Self::Range)
    }
}

impl QueryObjType {
    pub(crate) fn symbol_type(self) -> SymbolType {
        match self {
            Self::EqualTo
            | Self::NotEqualTo
            | Self::GreaterThan
            | Self::LessThan
            | Self::GreaterThanOrEqualTo
            | Self::LessThanOrEqualTo => SymbolType::Compare,
            Self::Like | Self::NotLike | Self::IsNull | Self::IsNotNull => SymbolType::Relational,
            Self::In | Self::NotIn => SymbolType::Range,
            Self::BeginGroup | Self::EndGroup => SymbolType::Logic,
            Self::And | Self::Or => SymbolType::Link,
            Self::Limit | Self::OrderBy => SymbolType::Special,
            Self::QueryByKeyPrefix => SymbolType::PrefixKey,
            Self::SuggestIndex => SymbolType::SuggestIndex,
            Self::Illegal => SymbolType::Invalid,
        }
    }

    /// SQL for relational operators; `None` for every other class.
    pub(crate) fn relational_sql(self) -> Option<&'static str> {
        Some(match self {
            Self::EqualTo => "= ",
            Self::NotEqualTo => "!= ",
            Self::GreaterThan => "> ",
            Self::LessThan => "< ",
            Self::GreaterThanOrEqualTo => ">= ",
            Self::LessThanOrEqualTo => "<= ",
            Self::Like => " LIKE ",
            Self::NotLike => " NOT LIKE ",
            Self::IsNull => " IS NULL ",
            Self::IsNotNull => " IS NOT NULL ",
            Self::In => " IN (",
            Self::NotIn => " NOT IN (",
            _ => return None,
        })
    }

    pub(crate) fn logic_sql(self) -> Option<&'static str> {
        match self {
            Self::And => Some(" AND "),
            Self::Or => Some(" OR "),
            Self::BeginGroup => Some("("),
            Self::EndGroup => Some(")"),
            _ => None,
        }
    }
}

/// Type shared by all values of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryValueType {
    /// The node carries no value.
    #[default]
    Null,
    Bool,
    Integer,
    Long,
    Double,
    String,
    /// Values of differing types were mixed in one node.
    Invalid,
}

/// A typed operand of a query node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Bool(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    String(String),
}

impl QueryValue {
    #[must_use]
    pub fn value_type(&self) -> QueryValueType {
        match self {
            Self::Bool(_) => QueryValueType::Bool,
            Self::Integer(_) => QueryValueType::Integer,
            Self::Long(_) => QueryValueType::Long,
            Self::Double(_) => QueryValueType::Double,
            Self::String(_) => QueryValueType::String,
        }
    }
}

impl From<bool> for QueryValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryValue {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<i64> for QueryValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for QueryValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for QueryValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// One operator with its field and operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryObjNode {
    pub op: QueryObjType,
    /// Field path as written by the caller; validated at compile time.
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub values: Vec<QueryValue>,
}

impl QueryObjNode {
    #[must_use]
    pub fn new(op: QueryObjType, field: impl Into<String>, values: Vec<QueryValue>) -> Self {
        Self {
            op,
            field: field.into(),
            values,
        }
    }

    fn bare(op: QueryObjType) -> Self {
        Self::new(op, String::new(), Vec::new())
    }

    /// The common type of all values, or `Invalid` when they differ.
    #[must_use]
    pub fn value_type(&self) -> QueryValueType {
        let mut types = self.values.iter().map(QueryValue::value_type);
        let Some(first) = types.next() else {
            return QueryValueType::Null;
        };
        if types.all(|t| t == first) {
            first
        } else {
            QueryValueType::Invalid
        }
    }
}

/// Fluent builder of query expressions.
///
/// ```
/// use kvschema_core::query::Query;
///
/// let query = Query::select()
///     .greater_than("$.age", 18)
///     .and()
///     .like("name", "A%")
///     .order_by("age", true)
///     .limit(10, 0);
/// assert_eq!(query.nodes().len(), 5);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    nodes: Vec<QueryObjNode>,
    #[serde(default)]
    prefix_key: Option<Vec<u8>>,
    #[serde(default)]
    suggest_index: Option<String>,
}

impl Query {
    /// An empty query matching every live entry.
    #[must_use]
    pub fn select() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn nodes(&self) -> &[QueryObjNode] {
        &self.nodes
    }

    #[must_use]
    pub fn prefix(&self) -> Option<&[u8]> {
        self.prefix_key.as_deref()
    }

    #[must_use]
    pub fn suggested_index(&self) -> Option<&str> {
        self.suggest_index.as_deref()
    }

    pub(crate) fn into_parts(self) -> (Vec<QueryObjNode>, Option<Vec<u8>>, Option<String>) {
        (self.nodes, self.prefix_key, self.suggest_index)
    }

    #[must_use]
    pub fn push(mut self, node: QueryObjNode) -> Self {
        self.nodes.push(node);
        self
    }

    fn compare(self, op: QueryObjType, field: &str, value: QueryValue) -> Self {
        self.push(QueryObjNode::new(op, field, vec![value]))
    }

    #[must_use]
    pub fn equal_to(self, field: &str, value: impl Into<QueryValue>) -> Self {
        self.compare(QueryObjType::EqualTo, field, value.into())
    }

    #[must_use]
    pub fn not_equal_to(self, field: &str, value: impl Into<QueryValue>) -> Self {
        self.compare(QueryObjType::NotEqualTo, field, value.into())
    }

    #[must_use]
    pub fn greater_than(self, field: &str, value: impl Into<QueryValue>) -> Self {
        self.compare(QueryObjType::GreaterThan, field, value.into())
    }

    #[must_use]
    pub fn less_than(self, field: &str, value: impl Into<QueryValue>) -> Self {
        self.compare(QueryObjType::LessThan, field, value.into())
    }

    #[must_use]
    pub fn greater_than_or_equal_to(self, field: &str, value: impl Into<QueryValue>) -> Self {
        self.compare(QueryObjType::GreaterThanOrEqualTo, field, value.into())
    }

    #[must_use]
    pub fn less_than_or_equal_to(self, field: &str, value: impl Into<QueryValue>) -> Self {
        self.compare(QueryObjType::LessThanOrEqualTo, field, value.into())
    }

    #[must_use]
    pub fn like(self, field: &str, pattern: &str) -> Self {
        self.compare(QueryObjType::Like, field, pattern.into())
    }

    #[must_use]
    pub fn not_like(self, field: &str, pattern: &str) -> Self {
        self.compare(QueryObjType::NotLike, field, pattern.into())
    }

    #[must_use]
    pub fn is_null(self, field: &str) -> Self {
        self.push(QueryObjNode::new(QueryObjType::IsNull, field, Vec::new()))
    }

    #[must_use]
    pub fn is_not_null(self, field: &str) -> Self {
        self.push(QueryObjNode::new(QueryObjType::IsNotNull, field, Vec::new()))
    }

    #[must_use]
    pub fn in_list<V: Into<QueryValue>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push(QueryObjNode::new(QueryObjType::In, field, values))
    }

    #[must_use]
    pub fn not_in_list<V: Into<QueryValue>>(
        self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push(QueryObjNode::new(QueryObjType::NotIn, field, values))
    }

    #[must_use]
    pub fn begin_group(self) -> Self {
        self.push(QueryObjNode::bare(QueryObjType::BeginGroup))
    }

    #[must_use]
    pub fn end_group(self) -> Self {
        self.push(QueryObjNode::bare(QueryObjType::EndGroup))
    }

    #[must_use]
    pub fn and(self) -> Self {
        self.push(QueryObjNode::bare(QueryObjType::And))
    }

    #[must_use]
    pub fn or(self) -> Self {
        self.push(QueryObjNode::bare(QueryObjType::Or))
    }

    #[must_use]
    pub fn order_by(self, field: &str, ascending: bool) -> Self {
        self.compare(QueryObjType::OrderBy, field, ascending.into())
    }

    #[must_use]
    pub fn limit(self, number: i32, offset: i32) -> Self {
        self.push(QueryObjNode::new(
            QueryObjType::Limit,
            String::new(),
            vec![number.into(), offset.into()],
        ))
    }

    /// Restricts results to keys starting with `prefix`.
    #[must_use]
    pub fn prefix_key(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.prefix_key = Some(prefix.into());
        self.push(QueryObjNode::bare(QueryObjType::QueryByKeyPrefix))
    }

    /// Hints the storage engine to use the named schema index.
    #[must_use]
    pub fn suggest_index(mut self, index_name: &str) -> Self {
        self.suggest_index = Some(index_name.to_string());
        self.push(QueryObjNode::bare(QueryObjType::SuggestIndex))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_classes() {
        assert_eq!(QueryObjType::LessThan.symbol_type(), SymbolType::Compare);
        assert_eq!(QueryObjType::IsNull.symbol_type(), SymbolType::Relational);
        assert_eq!(QueryObjType::NotIn.symbol_type(), SymbolType::Range);
        assert_eq!(QueryObjType::Limit.symbol_type(), SymbolType::Special);
        assert_eq!(QueryObjType::Illegal.symbol_type(), SymbolType::Invalid);
        assert!(QueryObjType::In.symbol_type().is_condition());
        assert!(!QueryObjType::Or.symbol_type().is_condition());
        assert_eq!(QueryObjType::Or.relational_sql(), None);
        assert_eq!(QueryObjType::EndGroup.logic_sql(), Some(")"));
    }

    #[test]
    fn mixed_in_list_is_invalid() {
        let node = QueryObjNode::new(
            QueryObjType::In,
            "a",
            vec![QueryValue::Integer(1), QueryValue::Long(2)],
        );
        assert_eq!(node.value_type(), QueryValueType::Invalid);
        let empty = QueryObjNode::new(QueryObjType::In, "a", Vec::new());
        assert_eq!(empty.value_type(), QueryValueType::Null);
    }

    #[test]
    fn builder_records_prefix_and_index() {
        let query = Query::select()
            .prefix_key(b"user:".to_vec())
            .equal_to("a", true)
            .suggest_index("$.a");
        assert_eq!(query.prefix(), Some(&b"user:"[..]));
        assert_eq!(query.suggested_index(), Some("$.a"));
        assert_eq!(query.nodes()[0].op, QueryObjType::QueryByKeyPrefix);
        assert_eq!(query.nodes()[1].value_type(), QueryValueType::Bool);
    }

    #[test]
    fn query_deserializes_from_json() {
        let query: Query = serde_json::from_str(
            r#"{"nodes":[{"op":"equal_to","field":"a","values":[5]},{"op":"and"},
                {"op":"in","field":"b","values":[1.5,2.5]}]}"#,
        )
        .unwrap();
        assert_eq!(query.nodes()[0].values, vec![QueryValue::Integer(5)]);
        assert_eq!(query.nodes()[2].value_type(), QueryValueType::Double);
    }
}
