//! Parameterized statement builders.
//!
//! Identifiers are double-quoted and values always bind as parameters; no
//! caller-provided SQL text reaches the engine.

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{json_to_sql, Record, Result, StoreError};

/// Exact-match column filters for `select`
pub type QueryFilter = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[default]
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
}

impl Operator {
    fn sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Like => "LIKE",
        }
    }
}

/// One `column op value` condition of an update/delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    #[serde(default)]
    pub op: Operator,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Eq, value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    /// Only `asc` (any case) sorts ascending; anything else is DESC.
    pub fn parse(text: &str) -> Self {
        if text.trim().eq_ignore_ascii_case("asc") {
            SortDirection::Asc
        } else {
            SortDirection::Desc
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn new(column: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }

    /// Parse the `"column direction"` form.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let column = parts.next()?;
        let direction = parts.next().map(SortDirection::parse).unwrap_or_default();
        Some(Self::new(column, direction))
    }

    /// Accepts either a string or a `{column, direction}` object.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Self::parse(text),
            Value::Object(fields) => {
                let column = fields.get("column")?.as_str()?.trim();
                if column.is_empty() {
                    return None;
                }
                let direction = fields
                    .get("direction")
                    .and_then(Value::as_str)
                    .map(SortDirection::parse)
                    .unwrap_or_default();
                Some(Self::new(column, direction))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(
        default,
        rename = "orderBy",
        alias = "order_by",
        deserialize_with = "lenient_order_by",
        skip_serializing_if = "Option::is_none"
    )]
    pub order_by: Option<OrderBy>,
    #[serde(
        default,
        deserialize_with = "positive_limit",
        skip_serializing_if = "Option::is_none"
    )]
    pub limit: Option<u64>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy::new(column, direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = (limit > 0).then_some(limit);
        self
    }
}

fn lenient_order_by<'de, D>(deserializer: D) -> std::result::Result<Option<OrderBy>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(OrderBy::from_json))
}

/// Limits that are not positive integers are ignored rather than rejected.
fn positive_limit<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(limit_from_json))
}

/// Positive integral numbers only; integral floats such as `10.0` count.
pub fn limit_from_json(value: &Value) -> Option<u64> {
    let n = match value {
        Value::Number(n) => n,
        _ => return None,
    };
    if let Some(n) = n.as_u64() {
        return (n > 0).then_some(n);
    }
    match n.as_f64() {
        Some(f) if f >= 1.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Some(f as u64),
        _ => None,
    }
}

pub fn quote_ident(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidInput("identifier must not be empty".into()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

pub fn build_insert(table: &str, record: &Record) -> Result<Statement> {
    if record.is_empty() {
        return Err(StoreError::InvalidInput("record must not be empty".into()));
    }
    let mut columns = Vec::with_capacity(record.len());
    let mut params = Vec::with_capacity(record.len());
    for (column, value) in record {
        columns.push(quote_ident(column)?);
        params.push(json_to_sql(value));
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            columns.join(", "),
            placeholders
        ),
        params,
    })
}

pub fn build_update(table: &str, record: &Record, predicates: &[Predicate]) -> Result<Statement> {
    if record.is_empty() {
        return Err(StoreError::InvalidInput("update data must not be empty".into()));
    }
    let mut assignments = Vec::with_capacity(record.len());
    let mut params = Vec::with_capacity(record.len() + predicates.len());
    for (column, value) in record {
        assignments.push(format!("{} = ?", quote_ident(column)?));
        params.push(json_to_sql(value));
    }
    let (clause, where_params) = build_where(predicates)?;
    params.extend(where_params);
    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table)?,
            assignments.join(", "),
            clause
        ),
        params,
    })
}

pub fn build_select(table: &str, filters: &QueryFilter, options: &QueryOptions) -> Result<Statement> {
    let mut sql = format!("SELECT * FROM {}", quote_ident(table)?);
    let mut params = Vec::new();

    if !filters.is_empty() {
        let mut conditions = Vec::with_capacity(filters.len());
        for (column, value) in filters {
            let column = quote_ident(column)?;
            if value.is_null() {
                conditions.push(format!("{} IS NULL", column));
            } else {
                conditions.push(format!("{} = ?", column));
                params.push(json_to_sql(value));
            }
        }
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if let Some(order) = &options.order_by {
        sql.push_str(&format!(" ORDER BY {} {}", quote_ident(&order.column)?, order.direction.sql()));
    }

    if let Some(limit) = options.limit.filter(|n| *n > 0) {
        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    Ok(Statement { sql, params })
}

pub fn build_delete(table: &str, predicates: &[Predicate]) -> Result<Statement> {
    let (clause, params) = build_where(predicates)?;
    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {}", quote_ident(table)?, clause),
        params,
    })
}

fn build_where(predicates: &[Predicate]) -> Result<(String, Vec<SqlValue>)> {
    if predicates.is_empty() {
        return Err(StoreError::InvalidInput("at least one predicate is required".into()));
    }
    let mut conditions = Vec::with_capacity(predicates.len());
    let mut params = Vec::with_capacity(predicates.len());
    for predicate in predicates {
        let column = quote_ident(&predicate.column)?;
        if predicate.value.is_null() {
            match predicate.op {
                Operator::Eq => conditions.push(format!("{} IS NULL", column)),
                Operator::Ne => conditions.push(format!("{} IS NOT NULL", column)),
                op => {
                    return Err(StoreError::InvalidInput(format!(
                        "operator {:?} cannot compare against null",
                        op
                    )))
                }
            }
        } else {
            conditions.push(format!("{} {} ?", column, predicate.op.sql()));
            params.push(json_to_sql(&predicate.value));
        }
    }
    Ok((conditions.join(" AND "), params))
}
