//! Compiles a validated node list into SQL over the `sync_data` table.

use tracing::{debug, warn};

use super::node::{Query, QueryObjNode, QueryObjType, QueryValue, QueryValueType, SymbolType};
use super::QueryLimits;
use crate::error::{SchemaError, SchemaResult};
use crate::limits::MAX_KEY_SIZE;
use crate::schema::SchemaObject;
use crate::types::FieldType;
use crate::utils;

const PRE_QUERY_KV_SQL: &str = "SELECT key, value FROM sync_data ";
const PRE_QUERY_ROWID_SQL: &str = "SELECT rowid FROM sync_data ";
const PRE_GET_COUNT_SQL: &str = "SELECT count(*) FROM sync_data ";
const FILTER_NATIVE_DATA_SQL: &str = "WHERE (flag&0x01=0) ";
const PREFIX_KEY_SQL: &str = " AND (key>=? AND key<=?) ";
const USING_INDEX: &str = "INDEXED BY ";

/// `limit` reported when the query has no LIMIT node.
pub const INVALID_LIMIT: i32 = i32::MAX;

/// A positional SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    /// Booleans bind as `0` or `1`.
    Integer(i64),
    Double(f64),
    Text(String),
    /// Prefix-key bounds.
    Blob(Vec<u8>),
}

/// A query bound to a schema, compiled to SQL on demand.
///
/// Validation runs before every SQL request; the first failure marks the
/// object permanently invalid. The query SQL is compiled once and cached.
#[derive(Debug, Clone)]
pub struct QueryObject {
    nodes: Vec<QueryObjNode>,
    prefix_key: Vec<u8>,
    suggest_index: String,
    schema: SchemaObject,
    limits: QueryLimits,
    is_valid: bool,
    query_sql: Option<String>,
    limit: i32,
    offset: i32,
    order_by_counts: usize,
    has_order_by: bool,
    has_limit: bool,
    has_prefix_key: bool,
    is_order_by_appeared: bool,
    need_order_by_key: bool,
}

impl QueryObject {
    #[must_use]
    pub fn new(query: Query) -> Self {
        let (nodes, prefix_key, suggest_index) = query.into_parts();
        Self {
            nodes,
            prefix_key: prefix_key.unwrap_or_default(),
            suggest_index: suggest_index.unwrap_or_default(),
            schema: SchemaObject::default(),
            limits: QueryLimits::default(),
            is_valid: true,
            query_sql: None,
            limit: INVALID_LIMIT,
            offset: 0,
            order_by_counts: 0,
            has_order_by: false,
            has_limit: false,
            has_prefix_key: false,
            is_order_by_appeared: false,
            need_order_by_key: true,
        }
    }

    /// Binds the schema used to resolve field paths.
    pub fn set_schema(&mut self, schema: &SchemaObject) {
        self.schema = schema.clone();
    }

    #[must_use]
    pub fn with_schema(mut self, schema: &SchemaObject) -> Self {
        self.set_schema(schema);
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: QueryLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn nodes(&self) -> &[QueryObjNode] {
        &self.nodes
    }

    #[must_use]
    pub fn has_limit(&self) -> bool {
        self.has_limit
    }

    #[must_use]
    pub fn has_prefix_key(&self) -> bool {
        self.has_prefix_key
    }

    /// `(limit, offset)`; `limit` is [`INVALID_LIMIT`] until a count SQL
    /// has been generated for a query carrying LIMIT.
    #[must_use]
    pub fn limit_values(&self) -> (i32, i32) {
        (self.limit, self.offset)
    }

    /// A count is meaningless once LIMIT or ORDER BY is involved.
    #[must_use]
    pub fn is_count_valid(&self) -> bool {
        if self.has_limit || self.has_order_by {
            debug!("count is not valid with limit or order by");
            return false;
        }
        true
    }

    /// SQL selecting `key, value` (or only `rowid`) of matching entries.
    pub fn query_sql(&mut self, only_rowid: bool) -> SchemaResult<String> {
        self.ensure_valid()?;
        let base = if only_rowid {
            PRE_QUERY_ROWID_SQL
        } else {
            PRE_QUERY_KV_SQL
        };
        let mut sql = self.assemble_head(base);
        if let Some(cached) = &self.query_sql {
            debug!("query object already compiled");
            sql.push_str(cached);
            return Ok(sql);
        }
        let body = self.to_query_sql()?;
        sql.push_str(&body);
        self.query_sql = Some(body);
        Ok(sql)
    }

    /// SQL counting matching entries. LIMIT and ORDER BY nodes are skipped
    /// and recorded instead.
    pub fn count_sql(&mut self) -> SchemaResult<String> {
        self.ensure_valid()?;
        let body = self.to_count_sql()?;
        let mut sql = self.assemble_head(PRE_GET_COUNT_SQL);
        sql.push_str(&body);
        Ok(sql)
    }

    /// Positional parameters for the generated SQL: the prefix-key bounds
    /// first, then every condition value in node order.
    pub fn bind_args(&self) -> SchemaResult<Vec<SqlArg>> {
        let mut args = Vec::new();
        if self.has_prefix_key {
            let mut upper = self.prefix_key.clone();
            upper.resize(MAX_KEY_SIZE.max(upper.len()), u8::MAX);
            args.push(SqlArg::Blob(self.prefix_key.clone()));
            args.push(SqlArg::Blob(upper));
        }
        for node in &self.nodes {
            if !node.op.symbol_type().is_condition() {
                continue;
            }
            for value in &node.values {
                args.push(self.bind_value(value)?);
            }
        }
        Ok(args)
    }

    fn bind_value(&self, value: &QueryValue) -> SchemaResult<SqlArg> {
        Ok(match value {
            QueryValue::Bool(b) => SqlArg::Integer(i64::from(*b)),
            QueryValue::Integer(i) => SqlArg::Integer(i64::from(*i)),
            QueryValue::Long(l) => SqlArg::Integer(*l),
            QueryValue::Double(d) => SqlArg::Double(*d),
            QueryValue::String(s) => {
                if s.len() > self.limits.max_bind_size {
                    warn!(len = s.len(), "bind string too long");
                    return Err(SchemaError::MaxLimits(format!(
                        "bind string of {} bytes exceeds {}",
                        s.len(),
                        self.limits.max_bind_size
                    )));
                }
                SqlArg::Text(s.clone())
            }
        })
    }

    // -----------------------------------------------------------------------
    // Legality
    // -----------------------------------------------------------------------

    fn ensure_valid(&mut self) -> SchemaResult<()> {
        if !self.is_valid {
            warn!("query object already found invalid");
            return Err(SchemaError::InvalidQueryFormat("invalid query object".into()));
        }
        self.check_legality().inspect_err(|e| {
            warn!(error = %e, "query is not legal");
            self.is_valid = false;
        })
    }

    fn check_legality(&mut self) -> SchemaResult<()> {
        self.has_prefix_key = false;
        self.order_by_counts = 0;
        for index in 0..self.nodes.len() {
            self.check_node(index)?;
        }
        Ok(())
    }

    fn format_error(msg: impl Into<String>) -> SchemaError {
        SchemaError::InvalidQueryFormat(msg.into())
    }

    fn next_symbol(&self, index: usize) -> Option<SymbolType> {
        self.nodes.get(index + 1).map(|n| n.op.symbol_type())
    }

    fn check_node(&mut self, index: usize) -> SchemaResult<()> {
        let node = &self.nodes[index];
        let symbol = node.op.symbol_type();
        if symbol == SymbolType::PrefixKey && self.has_prefix_key {
            return Err(Self::format_error("prefix key filter given twice"));
        }
        if symbol == SymbolType::Invalid || node.value_type() == QueryValueType::Invalid {
            return Err(Self::format_error(format!("illegal node {:?}", node.op)));
        }
        match symbol {
            s if s.is_condition() => self.check_condition(index),
            SymbolType::Link => self.check_link(index),
            SymbolType::Special if node.op == QueryObjType::Limit => {
                self.has_limit = true;
                match self.next_symbol(index) {
                    None | Some(SymbolType::SuggestIndex) => Ok(()),
                    Some(_) => Err(Self::format_error(
                        "limit must be last or just before suggest index",
                    )),
                }
            }
            SymbolType::Special => self.check_order_by(index),
            SymbolType::PrefixKey => {
                self.has_prefix_key = true;
                if self.prefix_key.len() > self.limits.max_prefix_key_size {
                    return Err(SchemaError::InvalidArgs(format!(
                        "prefix key of {} bytes",
                        self.prefix_key.len()
                    )));
                }
                Ok(())
            }
            SymbolType::SuggestIndex => {
                if self.next_symbol(index).is_some() {
                    return Err(Self::format_error("suggest index must be the last node"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn resolve_field(&self, node: &QueryObjNode) -> SchemaResult<FieldType> {
        if !self.schema.is_valid() {
            return Err(SchemaError::NotSupport("query fields need a schema".into()));
        }
        let path = utils::parse_and_check_field_path(&node.field)
            .map_err(|e| SchemaError::InvalidQueryField(format!("{:?}: {e}", node.field)))?;
        self.schema
            .check_queryable_and_get_field_type(&path)
            .map_err(|e| SchemaError::InvalidQueryField(format!("{path}: {e}")))
    }

    fn check_condition(&self, index: usize) -> SchemaResult<()> {
        let node = &self.nodes[index];
        let field_type = self.resolve_field(node)?;
        if field_type == FieldType::Bool
            && node.op.symbol_type() == SymbolType::Compare
            && !matches!(node.op, QueryObjType::EqualTo | QueryObjType::NotEqualTo)
        {
            return Err(Self::format_error(format!(
                "bool field {} only supports equality",
                node.field
            )));
        }
        if self.next_symbol(index).is_some_and(SymbolType::is_condition) {
            return Err(Self::format_error("conditions must be joined by AND or OR"));
        }
        Ok(())
    }

    fn check_link(&self, index: usize) -> SchemaResult<()> {
        if index == 0 {
            return Err(Self::format_error("a query cannot begin with a connective"));
        }
        match self.next_symbol(index) {
            None => {
                return Err(Self::format_error("a query cannot end with a connective"));
            }
            Some(SymbolType::Invalid | SymbolType::Link | SymbolType::Special) => {
                return Err(Self::format_error("a connective must be followed by a condition"));
            }
            Some(_) => {}
        }
        let before = self.nodes[index - 1].op.symbol_type();
        if before.is_condition() || matches!(before, SymbolType::Logic | SymbolType::PrefixKey) {
            Ok(())
        } else {
            Err(Self::format_error("a connective must follow a condition"))
        }
    }

    fn check_order_by(&mut self, index: usize) -> SchemaResult<()> {
        let field_type = self.resolve_field(&self.nodes[index])?;
        if field_type == FieldType::Bool {
            return Err(Self::format_error("cannot order by a bool field"));
        }
        self.has_order_by = true;
        self.order_by_counts += 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // SQL emission
    // -----------------------------------------------------------------------

    fn assemble_head(&self, base: &str) -> String {
        let mut sql = base.to_string();
        if let Some(index) = self.format_suggest_index() {
            sql.push_str(&format!("{USING_INDEX}'{index}' "));
        }
        sql.push_str(FILTER_NATIVE_DATA_SQL);
        if self.has_prefix_key {
            sql.push_str(PREFIX_KEY_SQL);
        }
        sql
    }

    /// The suggested index, if it names a declared schema index.
    fn format_suggest_index(&self) -> Option<String> {
        if self.suggest_index.is_empty() {
            return None;
        }
        let name = match utils::parse_and_check_field_path(&self.suggest_index) {
            Ok(name) => name,
            Err(e) => {
                warn!(index = %self.suggest_index, error = %e, "suggested index is malformed");
                return None;
            }
        };
        if !self.schema.is_index_exist(&name) {
            warn!(index = %name, "suggested index does not exist");
            return None;
        }
        Some(name.to_string())
    }

    fn open_bracket(&self, sql: &mut String) -> bool {
        for node in &self.nodes {
            match node.op.symbol_type() {
                s if s.is_condition() => {
                    sql.push_str(" AND (");
                    return true;
                }
                SymbolType::Logic | SymbolType::PrefixKey => {}
                _ => return false,
            }
        }
        false
    }

    fn trailing_order_by_key(&self, sql: &mut String) {
        if self.has_prefix_key && !self.has_order_by && !self.has_limit && self.need_order_by_key {
            sql.push_str("ORDER BY key ASC");
        }
    }

    fn to_query_sql(&mut self) -> SchemaResult<String> {
        let mut sql = String::new();
        if self.nodes.is_empty() {
            sql.push(';');
            return Ok(sql);
        }
        let mut need_end_bracket = self.open_bracket(&mut sql);
        let nodes = std::mem::take(&mut self.nodes);
        let result = nodes.iter().try_for_each(|node| {
            if node.op.symbol_type() == SymbolType::Special && need_end_bracket {
                sql.push_str(") ");
                need_end_bracket = false;
            }
            self.emit_node(node, &mut sql)
        });
        self.nodes = nodes;
        result?;
        if need_end_bracket {
            sql.push_str(") ");
        }
        self.trailing_order_by_key(&mut sql);
        sql.push(';');
        debug!(%sql, "query compiled");
        Ok(sql)
    }

    fn to_count_sql(&mut self) -> SchemaResult<String> {
        let mut sql = String::new();
        if self.nodes.is_empty() {
            sql.push(';');
            return Ok(sql);
        }
        let mut need_end_bracket = self.open_bracket(&mut sql);
        let nodes = std::mem::take(&mut self.nodes);
        let result = nodes.iter().try_for_each(|node| {
            if node.op.symbol_type() == SymbolType::Special && need_end_bracket {
                sql.push_str(") ");
                need_end_bracket = false;
            }
            match node.op {
                QueryObjType::Limit => {
                    self.has_limit = true;
                    if let [QueryValue::Integer(limit), QueryValue::Integer(offset)] =
                        node.values.as_slice()
                    {
                        self.limit = *limit;
                        self.offset = *offset;
                    }
                    Ok(())
                }
                QueryObjType::OrderBy => {
                    self.has_order_by = true;
                    Ok(())
                }
                _ => self.emit_node(node, &mut sql),
            }
        });
        self.nodes = nodes;
        result?;
        if need_end_bracket {
            sql.push_str(") ");
        }
        self.trailing_order_by_key(&mut sql);
        sql.push(';');
        Ok(sql)
    }

    fn emit_node(&mut self, node: &QueryObjNode, sql: &mut String) -> SchemaResult<()> {
        let symbol = node.op.symbol_type();
        if symbol == SymbolType::Range && node.values.len() > self.limits.max_conditions {
            warn!(conditions = node.values.len(), "too many range conditions");
            return Err(SchemaError::MaxLimits(format!(
                "{} range conditions exceed {}",
                node.values.len(),
                self.limits.max_conditions
            )));
        }
        if symbol.is_condition() {
            sql.push_str(&self.cast_sql(node));
            sql.push_str(&Self::relational_sql(node));
        } else if let Some(logic) = node.op.logic_sql() {
            sql.push_str(logic);
        } else {
            sql.push_str(&self.keyword_sql(node));
        }
        if sql.len() > self.limits.max_sql_len {
            warn!(len = sql.len(), "generated sql too long");
            return Err(SchemaError::MaxLimits(format!("sql of {} bytes", sql.len())));
        }
        Ok(())
    }

    fn relational_sql(node: &QueryObjNode) -> String {
        let Some(op) = node.op.relational_sql() else {
            return String::new();
        };
        let mut sql = op.to_string();
        for i in 0..node.values.len() {
            sql.push_str(if i == 0 { " ? " } else { ", ? " });
        }
        if node.op.symbol_type() == SymbolType::Range {
            sql.push(')');
        }
        sql
    }

    /// Extraction expression for the node's field. Using it means results
    /// are no longer ordered by key.
    fn cast_sql(&mut self, node: &QueryObjNode) -> String {
        let needs_cast_without_value = matches!(
            node.op,
            QueryObjType::IsNull | QueryObjType::IsNotNull | QueryObjType::In | QueryObjType::NotIn
        );
        if node.values.is_empty() && !needs_cast_without_value {
            return String::new();
        }
        // Legality checks already resolved this field.
        let Ok(path) = utils::parse_and_check_field_path(&node.field) else {
            return String::new();
        };
        let field_type = self
            .schema
            .check_queryable_and_get_field_type(&path)
            .unwrap_or(FieldType::Integer);
        self.need_order_by_key = false;
        utils::generate_extract_sql(
            self.schema.schema_type(),
            &path,
            field_type,
            self.schema.skip_size(),
        )
    }

    fn keyword_sql(&mut self, node: &QueryObjNode) -> String {
        let mut sql = String::new();
        match (node.op, node.values.as_slice()) {
            (QueryObjType::OrderBy, [ascending]) => {
                if !self.is_order_by_appeared {
                    sql.push_str("ORDER BY ");
                }
                sql.push_str(&self.cast_sql(node));
                let ascending = matches!(ascending, QueryValue::Bool(true));
                sql.push_str(if ascending { "ASC," } else { "DESC," });
                self.order_by_counts = self.order_by_counts.saturating_sub(1);
                if self.order_by_counts == 0 {
                    sql.pop();
                }
                self.is_order_by_appeared = true;
            }
            (QueryObjType::Limit, [QueryValue::Integer(limit), QueryValue::Integer(offset)]) => {
                if self.has_prefix_key && !self.has_order_by && self.need_order_by_key {
                    sql.push_str("ORDER BY key ASC ");
                }
                sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
            }
            _ => {}
        }
        sql
    }
}
