//! Schema-driven conversion between logical records and storage values.
//!
//! Logical records are camelCase JSON objects: dates are RFC 3339 strings,
//! booleans are booleans, JSON fields are nested values. Each backend has its
//! own storage convention, captured by [`Transformer`]:
//!
//! | backend  | names      | date         | boolean | json          |
//! |----------|------------|--------------|---------|---------------|
//! | mongodb  | identity   | native       | native  | native        |
//! | postgres | snake_case | TIMESTAMPTZ  | native  | text          |
//! | libsql   | identity   | ISO-8601 text| 1 / 0   | text          |
//! | rest     | snake_case | ISO-8601     | native  | text          |

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

use crate::config::DatabaseBackend;
use crate::db::schema::{FieldType, SchemaDefinition, lookup};
use crate::error::DatabaseError;

/// A logical row keyed by camelCase field names.
pub type Record = serde_json::Map<String, Value>;

/// Backend-neutral storage value; each adapter maps it onto its driver type.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingConvention {
    Identity,
    SnakeCase,
}

/// camelCase → snake_case. `userId` → `user_id`, `apiURL` → `api_u_r_l`.
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// snake_case → camelCase. Leading underscores are preserved (`_id` stays `_id`).
pub fn to_camel_case(name: &str) -> String {
    let trimmed = name.trim_start_matches('_');
    let mut out = String::with_capacity(name.len());
    out.push_str(&name[..name.len() - trimmed.len()]);

    let mut upper_next = false;
    for ch in trimmed.chars() {
        if ch == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Canonical logical rendering of a timestamp (millisecond precision, `Z`).
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Accepts RFC 3339 and SQLite's `YYYY-MM-DD HH:MM:SS[.fff]` (assumed UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(DatabaseError::Serialization(format!(
        "invalid timestamp '{raw}'"
    )))
}

fn type_mismatch(field: &str, expected: &str, value: &Value) -> DatabaseError {
    DatabaseError::Validation(format!("field '{field}' expects {expected}, got {value}"))
}

fn logical_date(field: &str, value: &Value) -> Result<DateTime<Utc>, DatabaseError> {
    match value {
        Value::String(s) => parse_timestamp(s)
            .map_err(|_| DatabaseError::Validation(format!("field '{field}' has invalid date '{s}'"))),
        // Epoch milliseconds, as produced by JavaScript clients.
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| type_mismatch(field, "a date", value)),
        other => Err(type_mismatch(field, "a date", other)),
    }
}

fn number_to_storage(n: &Number) -> StorageValue {
    match n.as_i64() {
        Some(i) => StorageValue::Integer(i),
        None => StorageValue::Real(n.as_f64().unwrap_or_default()),
    }
}

fn integral_number(f: f64) -> Value {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 9.007_199_254_740_992e15 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn untyped_from_storage(value: StorageValue) -> Value {
    match value {
        StorageValue::Null => Value::Null,
        StorageValue::Bool(b) => Value::Bool(b),
        StorageValue::Integer(i) => Value::from(i),
        StorageValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        StorageValue::Text(s) => Value::String(s),
        StorageValue::Timestamp(dt) => Value::String(format_timestamp(&dt)),
        StorageValue::Json(v) => v,
    }
}

/// Storage rules of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transformer {
    backend: DatabaseBackend,
}

impl Transformer {
    pub fn new(backend: DatabaseBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn naming(&self) -> NamingConvention {
        match self.backend {
            DatabaseBackend::Postgres | DatabaseBackend::Rest => NamingConvention::SnakeCase,
            DatabaseBackend::MongoDb | DatabaseBackend::LibSql => NamingConvention::Identity,
        }
    }

    pub fn storage_name(&self, logical: &str) -> String {
        match self.naming() {
            NamingConvention::SnakeCase => to_snake_case(logical),
            NamingConvention::Identity => logical.to_string(),
        }
    }

    pub fn logical_name(&self, storage: &str) -> String {
        match self.naming() {
            NamingConvention::SnakeCase => to_camel_case(storage),
            NamingConvention::Identity => storage.to_string(),
        }
    }

    /// Convert one logical value for writing or filtering.
    pub fn to_storage_value(
        &self,
        field: &str,
        field_type: Option<FieldType>,
        value: &Value,
    ) -> Result<StorageValue, DatabaseError> {
        if value.is_null() {
            return Ok(StorageValue::Null);
        }

        let Some(field_type) = field_type else {
            return Ok(match value {
                Value::Bool(b) => StorageValue::Bool(*b),
                Value::Number(n) => number_to_storage(n),
                Value::String(s) => StorageValue::Text(s.clone()),
                other => StorageValue::Json(other.clone()),
            });
        };

        match field_type {
            FieldType::Date => {
                let dt = logical_date(field, value)?;
                Ok(match self.backend {
                    DatabaseBackend::LibSql | DatabaseBackend::Rest => {
                        StorageValue::Text(format_timestamp(&dt))
                    }
                    DatabaseBackend::Postgres | DatabaseBackend::MongoDb => {
                        StorageValue::Timestamp(dt)
                    }
                })
            }
            FieldType::Boolean => {
                let flag = match value {
                    Value::Bool(b) => *b,
                    Value::Number(n) if n.as_i64() == Some(0) => false,
                    Value::Number(n) if n.as_i64() == Some(1) => true,
                    other => return Err(type_mismatch(field, "a boolean", other)),
                };
                Ok(match self.backend {
                    DatabaseBackend::LibSql => StorageValue::Integer(i64::from(flag)),
                    _ => StorageValue::Bool(flag),
                })
            }
            FieldType::Json => Ok(match (self.backend, value) {
                (DatabaseBackend::MongoDb, v) => StorageValue::Json(v.clone()),
                // Strings are serialized too, so `"123"` never reads back as 123.
                (_, v) => StorageValue::Text(serde_json::to_string(v)?),
            }),
            FieldType::Number => match value {
                Value::Number(n) => Ok(match self.backend {
                    // DOUBLE PRECISION column: the driver binds f64 only.
                    DatabaseBackend::Postgres => StorageValue::Real(n.as_f64().unwrap_or_default()),
                    _ => number_to_storage(n),
                }),
                other => Err(type_mismatch(field, "a number", other)),
            },
            FieldType::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(StorageValue::Integer)
                    .ok_or_else(|| type_mismatch(field, "an integer", value)),
                other => Err(type_mismatch(field, "an integer", other)),
            },
            FieldType::String => match value {
                Value::String(s) => Ok(StorageValue::Text(s.clone())),
                other => Err(type_mismatch(field, "a string", other)),
            },
        }
    }

    /// Convert one stored value back to its logical form.
    pub fn from_storage_value(
        &self,
        field_type: Option<FieldType>,
        value: StorageValue,
    ) -> Result<Value, DatabaseError> {
        if value == StorageValue::Null {
            return Ok(Value::Null);
        }
        let Some(field_type) = field_type else {
            return Ok(untyped_from_storage(value));
        };

        Ok(match (field_type, value) {
            (FieldType::Date, StorageValue::Timestamp(dt)) => {
                Value::String(format_timestamp(&dt))
            }
            (FieldType::Date, StorageValue::Text(s)) => {
                Value::String(format_timestamp(&parse_timestamp(&s)?))
            }
            (FieldType::Boolean, StorageValue::Integer(i)) => Value::Bool(i != 0),
            (FieldType::Boolean, StorageValue::Text(s)) => {
                Value::Bool(matches!(s.as_str(), "1" | "true" | "t"))
            }
            // Documents hold JSON natively; a text value there is a JSON string.
            (FieldType::Json, StorageValue::Text(s))
                if self.backend == DatabaseBackend::MongoDb =>
            {
                Value::String(s)
            }
            (FieldType::Json, StorageValue::Text(s)) => serde_json::from_str(&s).map_err(|e| {
                DatabaseError::Serialization(format!("stored JSON is malformed: {e}"))
            })?,
            (FieldType::Number | FieldType::Integer, StorageValue::Real(f)) => integral_number(f),
            (FieldType::Number | FieldType::Integer, StorageValue::Text(s)) => {
                match s.parse::<f64>() {
                    Ok(f) => integral_number(f),
                    Err(_) => Value::String(s),
                }
            }
            (_, other) => untyped_from_storage(other),
        })
    }

    /// Logical record → storage-named values, in the record's key order.
    pub fn to_storage(
        &self,
        record: &Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Vec<(String, StorageValue)>, DatabaseError> {
        record
            .iter()
            .map(|(field, value)| {
                let converted = self.to_storage_value(field, lookup(schema, field), value)?;
                Ok((self.storage_name(field), converted))
            })
            .collect()
    }

    /// Storage-named values → logical record.
    pub fn from_storage(
        &self,
        columns: Vec<(String, StorageValue)>,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Record, DatabaseError> {
        let mut record = Record::new();
        for (column, value) in columns {
            let field = self.logical_name(&column);
            let value = self.from_storage_value(lookup(schema, &field), value)?;
            record.insert(field, value);
        }
        Ok(record)
    }
}
