//! Parameterized SQL generation shared by the postgres and libsql adapters.
//!
//! Values are never interpolated: every value becomes a positional
//! placeholder (`$n` / `?n`) and is appended to [`SqlQuery::params`] in the
//! same order. Identifiers are validated and double-quoted.
//!
//! Null handling is normalized so that SQL backends match the document store:
//! `eq null` is `IS NULL`, `ne`/`nin` never match NULL, and ascending sorts put
//! NULLs first.

use crate::config::DatabaseBackend;
use crate::db::query::{Operator, OrderBy, QueryCondition, QueryOptions, SortDirection};
use crate::db::schema::{FieldType, PRIMARY_KEY, SchemaDefinition, lookup};
use crate::db::transform::{StorageValue, Transformer};
use crate::db::validate_identifier;
use crate::error::DatabaseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// Escape `LIKE` metacharacters so the needle matches literally under `ESCAPE '\'`.
fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl Dialect {
    pub fn backend(self) -> DatabaseBackend {
        match self {
            Self::Postgres => DatabaseBackend::Postgres,
            Self::Sqlite => DatabaseBackend::LibSql,
        }
    }

    fn placeholder(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::Sqlite => format!("?{index}"),
        }
    }

    fn like(self, column: &str, placeholder: &str) -> String {
        match self {
            Self::Postgres => format!("{column} ILIKE {placeholder} ESCAPE '\\'"),
            Self::Sqlite => format!("LOWER({column}) LIKE LOWER({placeholder}) ESCAPE '\\'"),
        }
    }

    fn unbounded_limit(self) -> &'static str {
        match self {
            Self::Postgres => "ALL",
            Self::Sqlite => "-1",
        }
    }

    fn column_type(self, field_type: FieldType) -> &'static str {
        match (self, field_type) {
            (_, FieldType::String | FieldType::Json) => "TEXT",
            (Self::Postgres, FieldType::Number) => "DOUBLE PRECISION",
            (Self::Postgres, FieldType::Integer) => "BIGINT",
            (Self::Postgres, FieldType::Boolean) => "BOOLEAN",
            (Self::Postgres, FieldType::Date) => "TIMESTAMPTZ",
            (Self::Sqlite, FieldType::Number) => "REAL",
            (Self::Sqlite, FieldType::Integer | FieldType::Boolean) => "INTEGER",
            (Self::Sqlite, FieldType::Date) => "TEXT",
        }
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<StorageValue>,
}

pub fn quote_ident(name: &str) -> Result<String, DatabaseError> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

/// Builds one statement; placeholders are numbered from 1 per builder.
pub struct SqlBuilder<'a> {
    dialect: Dialect,
    transformer: Transformer,
    schema: Option<&'a SchemaDefinition>,
    params: Vec<StorageValue>,
}

impl<'a> SqlBuilder<'a> {
    pub fn new(dialect: Dialect, schema: Option<&'a SchemaDefinition>) -> Self {
        Self {
            dialect,
            transformer: Transformer::new(dialect.backend()),
            schema,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: StorageValue) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn column(&self, field: &str) -> Result<String, DatabaseError> {
        quote_ident(&self.transformer.storage_name(field))
    }

    fn storage_value(
        &self,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<StorageValue, DatabaseError> {
        self.transformer
            .to_storage_value(field, lookup(self.schema, field), value)
    }

    fn condition(&mut self, condition: &QueryCondition) -> Result<String, DatabaseError> {
        condition.validate()?;
        let column = self.column(&condition.field)?;

        let comparison = |op: &str, builder: &mut Self| -> Result<String, DatabaseError> {
            let value = builder.storage_value(&condition.field, &condition.value)?;
            let placeholder = builder.bind(value);
            Ok(format!("{column} {op} {placeholder}"))
        };

        match condition.operator {
            Operator::Eq if condition.value.is_null() => Ok(format!("{column} IS NULL")),
            Operator::Ne if condition.value.is_null() => Ok(format!("{column} IS NOT NULL")),
            Operator::Eq => comparison("=", self),
            Operator::Ne => comparison("<>", self),
            Operator::Gt => comparison(">", self),
            Operator::Gte => comparison(">=", self),
            Operator::Lt => comparison("<", self),
            Operator::Lte => comparison("<=", self),
            Operator::In | Operator::Nin => {
                let values = condition.list_values()?;
                let negate = condition.operator == Operator::Nin;
                if values.is_empty() {
                    return Ok(if negate { "1 = 1" } else { "1 = 0" }.to_string());
                }
                let mut placeholders = Vec::with_capacity(values.len());
                for value in values {
                    let converted = self.storage_value(&condition.field, value)?;
                    placeholders.push(self.bind(converted));
                }
                let list = placeholders.join(", ");
                Ok(if negate {
                    format!("{column} NOT IN ({list})")
                } else {
                    format!("{column} IN ({list})")
                })
            }
            Operator::Like => {
                let pattern = format!("%{}%", escape_like(condition.like_needle()?));
                let placeholder = self.bind(StorageValue::Text(pattern));
                Ok(self.dialect.like(&column, &placeholder))
            }
            Operator::Exists => Ok(if condition.exists_flag()? {
                format!("{column} IS NOT NULL")
            } else {
                format!("{column} IS NULL")
            }),
        }
    }

    /// ` WHERE a AND b ...` in caller order, or an empty string.
    pub fn where_clause(&mut self, conditions: &[QueryCondition]) -> Result<String, DatabaseError> {
        if conditions.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(conditions.len());
        for condition in conditions {
            parts.push(self.condition(condition)?);
        }
        Ok(format!(" WHERE {}", parts.join(" AND ")))
    }

    /// ` ORDER BY ...` with the first entry as the primary sort key.
    pub fn order_by_clause(&self, order_by: &[OrderBy]) -> Result<String, DatabaseError> {
        if order_by.is_empty() {
            return Ok(String::new());
        }
        let parts = order_by
            .iter()
            .map(|entry| {
                let column = self.column(&entry.field)?;
                Ok(match entry.direction {
                    SortDirection::Asc => format!("{column} ASC NULLS FIRST"),
                    SortDirection::Desc => format!("{column} DESC NULLS LAST"),
                })
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    /// Trailing pagination; OFFSET is only ever emitted behind a LIMIT.
    pub fn limit_clause(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let offset = offset.filter(|o| *o > 0);
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!(" LIMIT {limit} OFFSET {offset}"),
            (Some(limit), None) => format!(" LIMIT {limit}"),
            (None, Some(offset)) => {
                format!(" LIMIT {} OFFSET {offset}", self.dialect.unbounded_limit())
            }
            (None, None) => String::new(),
        }
    }

    fn finish(self, sql: String) -> SqlQuery {
        SqlQuery {
            sql,
            params: self.params,
        }
    }

    pub fn select(mut self, table: &str, options: &QueryOptions) -> Result<SqlQuery, DatabaseError> {
        options.validate()?;
        let projection = match &options.select {
            Some(fields) if !fields.is_empty() => fields
                .iter()
                .map(|f| self.column(f))
                .collect::<Result<Vec<_>, _>>()?
                .join(", "),
            _ => "*".to_string(),
        };
        let mut sql = format!("SELECT {projection} FROM {}", quote_ident(table)?);
        sql.push_str(&self.where_clause(&options.conditions)?);
        sql.push_str(&self.order_by_clause(&options.order_by)?);
        sql.push_str(&self.limit_clause(options.limit, options.offset));
        Ok(self.finish(sql))
    }

    pub fn count(mut self, table: &str, options: &QueryOptions) -> Result<SqlQuery, DatabaseError> {
        options.validate()?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table)?);
        sql.push_str(&self.where_clause(&options.conditions)?);
        Ok(self.finish(sql))
    }

    /// `SELECT 1 ... WHERE id = ? LIMIT 1`; used to check before a keyed write.
    pub fn exists_by_id(mut self, table: &str, id: &str) -> Result<SqlQuery, DatabaseError> {
        let pk = self.column(PRIMARY_KEY)?;
        let placeholder = self.bind(StorageValue::Text(id.to_string()));
        let sql = format!(
            "SELECT 1 FROM {} WHERE {pk} = {placeholder} LIMIT 1",
            quote_ident(table)?
        );
        Ok(self.finish(sql))
    }

    pub fn insert(
        mut self,
        table: &str,
        columns: Vec<(String, StorageValue)>,
    ) -> Result<SqlQuery, DatabaseError> {
        let mut names = Vec::with_capacity(columns.len());
        let mut placeholders = Vec::with_capacity(columns.len());
        for (name, value) in columns {
            names.push(quote_ident(&name)?);
            placeholders.push(self.bind(value));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            names.join(", "),
            placeholders.join(", ")
        );
        Ok(self.finish(sql))
    }

    /// SET values bind first, then the WHERE values.
    pub fn update(
        mut self,
        table: &str,
        set: Vec<(String, StorageValue)>,
        conditions: &[QueryCondition],
    ) -> Result<SqlQuery, DatabaseError> {
        let mut assignments = Vec::with_capacity(set.len());
        for (name, value) in set {
            let column = quote_ident(&name)?;
            let placeholder = self.bind(value);
            assignments.push(format!("{column} = {placeholder}"));
        }
        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_ident(table)?,
            assignments.join(", ")
        );
        sql.push_str(&self.where_clause(conditions)?);
        Ok(self.finish(sql))
    }

    pub fn delete(
        mut self,
        table: &str,
        conditions: &[QueryCondition],
    ) -> Result<SqlQuery, DatabaseError> {
        let mut sql = format!("DELETE FROM {}", quote_ident(table)?);
        sql.push_str(&self.where_clause(conditions)?);
        Ok(self.finish(sql))
    }

    /// Idempotent DDL: the table plus an index on the tenant column if present.
    pub fn create_table(self, schema: &SchemaDefinition) -> Result<Vec<String>, DatabaseError> {
        let table = quote_ident(&schema.table_name)?;
        let mut columns = vec![format!("{} TEXT PRIMARY KEY", self.column(PRIMARY_KEY)?)];
        for (name, def) in schema.columns() {
            let mut column = format!(
                "{} {}",
                self.column(name)?,
                self.dialect.column_type(def.field_type)
            );
            if def.required {
                column.push_str(" NOT NULL");
            }
            columns.push(column);
        }
        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {table} ({})",
            columns.join(", ")
        )];

        if schema.field_type("userId").is_some() {
            let user_column = self.transformer.storage_name("userId");
            let index = quote_ident(&format!("idx_{}_{user_column}", schema.table_name))?;
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table} ({})",
                quote_ident(&user_column)?
            ));
        }
        Ok(statements)
    }
}
