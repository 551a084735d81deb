//! Backend-agnostic query model.
//!
//! A [`QueryOptions`] is a conjunction of [`QueryCondition`]s plus ordering,
//! pagination and projection. There is deliberately no OR / grouping node:
//! every adapter compiles the conditions as a flat AND.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DatabaseError;

/// Comparison operator of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Like,
    Exists,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::Nin => "nin",
            Self::Like => "like",
            Self::Exists => "exists",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "in" => Ok(Self::In),
            "nin" => Ok(Self::Nin),
            "like" => Ok(Self::Like),
            "exists" => Ok(Self::Exists),
            other => Err(DatabaseError::Unsupported(format!(
                "unknown query operator '{other}'"
            ))),
        }
    }
}

/// One `field <operator> value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCondition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl QueryCondition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Ne, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Gte, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Lte, value)
    }

    pub fn in_list<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(
            field,
            Operator::In,
            Value::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn not_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::new(
            field,
            Operator::Nin,
            Value::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Case-insensitive substring match.
    pub fn like(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::new(field, Operator::Like, Value::String(needle.into()))
    }

    /// `present = true` matches non-null values, `false` matches null/absent.
    pub fn exists(field: impl Into<String>, present: bool) -> Self {
        Self::new(field, Operator::Exists, Value::Bool(present))
    }

    /// Reject shapes the compilers cannot express before any I/O happens.
    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.field.trim().is_empty() {
            return Err(DatabaseError::Validation(
                "condition field must not be empty".to_string(),
            ));
        }
        match self.operator {
            Operator::In | Operator::Nin => self.list_values().map(|_| ()),
            Operator::Exists => self.exists_flag().map(|_| ()),
            Operator::Like => self.like_needle().map(|_| ()),
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte if self.value.is_null() => {
                Err(DatabaseError::Validation(format!(
                    "operator '{}' on '{}' cannot compare against null",
                    self.operator, self.field
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn list_values(&self) -> Result<&[Value], DatabaseError> {
        self.value.as_array().map(Vec::as_slice).ok_or_else(|| {
            DatabaseError::Validation(format!(
                "operator '{}' on '{}' requires an array value",
                self.operator, self.field
            ))
        })
    }

    pub fn exists_flag(&self) -> Result<bool, DatabaseError> {
        self.value.as_bool().ok_or_else(|| {
            DatabaseError::Validation(format!(
                "operator 'exists' on '{}' requires a boolean value",
                self.field
            ))
        })
    }

    pub fn like_needle(&self) -> Result<&str, DatabaseError> {
        self.value.as_str().ok_or_else(|| {
            DatabaseError::Validation(format!(
                "operator 'like' on '{}' requires a string value",
                self.field
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Filter, ordering, pagination and projection for a read or bulk write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    #[serde(rename = "where")]
    pub conditions: Vec<QueryCondition>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub select: Option<BTreeSet<String>>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: QueryCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(QueryCondition::eq(field, value))
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Same filter without ordering, pagination or projection; used for totals.
    pub fn filter_only(&self) -> Self {
        Self {
            conditions: self.conditions.clone(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), DatabaseError> {
        for condition in &self.conditions {
            condition.validate()?;
        }
        if self.limit == Some(0) {
            return Err(DatabaseError::Validation(
                "limit must be a positive integer".to_string(),
            ));
        }
        if self.order_by.iter().any(|o| o.field.trim().is_empty()) {
            return Err(DatabaseError::Validation(
                "orderBy field must not be empty".to_string(),
            ));
        }
        if let Some(select) = &self.select
            && select.iter().any(|f| f.trim().is_empty())
        {
            return Err(DatabaseError::Validation(
                "select must not contain empty field names".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn options_deserialize_from_api_shape() {
        let options: QueryOptions = serde_json::from_value(json!({
            "where": [
                { "field": "userId", "operator": "eq", "value": "u1" },
                { "field": "tags", "operator": "in", "value": ["a", "b"] }
            ],
            "orderBy": [{ "field": "createdAt", "direction": "desc" }],
            "limit": 10,
            "offset": 20
        }))
        .expect("deserialize");

        assert_eq!(options.conditions.len(), 2);
        assert_eq!(options.conditions[1].operator, Operator::In);
        assert_eq!(options.order_by[0].direction, SortDirection::Desc);
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.offset, Some(20));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn unknown_operator_is_unsupported_not_ignored() {
        let err = "regex".parse::<Operator>().expect_err("unknown operator");
        assert_eq!(err.code(), crate::error::ErrorCode::UnsupportedOperation);

        let parsed: Result<QueryCondition, _> =
            serde_json::from_value(json!({ "field": "a", "operator": "or", "value": 1 }));
        assert!(parsed.is_err());
    }

    #[test]
    fn in_requires_array_and_exists_requires_bool() {
        let bad_in = QueryCondition::new("status", Operator::In, "active");
        assert!(bad_in.validate().is_err());

        let bad_nin = QueryCondition::new("status", Operator::Nin, Value::Null);
        assert!(bad_nin.validate().is_err());

        let bad_exists = QueryCondition::new("deletedAt", Operator::Exists, "yes");
        assert!(bad_exists.validate().is_err());

        assert!(QueryCondition::exists("deletedAt", false).validate().is_ok());
        assert!(QueryCondition::in_list("status", ["a"]).validate().is_ok());
    }

    #[test]
    fn zero_limit_is_rejected() {
        let err = QueryOptions::new().limit(0).validate().expect_err("zero");
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
    }

    #[test]
    fn filter_only_drops_pagination() {
        let options = QueryOptions::new()
            .where_eq("userId", "u1")
            .order_by("name", SortDirection::Asc)
            .limit(5)
            .offset(5)
            .select(["name"]);
        let filter = options.filter_only();
        assert_eq!(filter.conditions, options.conditions);
        assert!(filter.order_by.is_empty());
        assert_eq!(filter.limit, None);
        assert_eq!(filter.offset, None);
        assert_eq!(filter.select, None);
    }
}
