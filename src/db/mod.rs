//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait: one CRUD/query contract that
//! every adapter compiles to its own query model. Implementations exist
//! behind feature flags:
//!
//! - `mongodb`: document store, native filter documents
//! - `postgres`: `deadpool-postgres` + `tokio-postgres`, parameterized SQL
//! - `libsql`: libSQL (embedded SQLite fork), parameterized SQL
//! - `rest`: hosted PostgREST/Supabase API through a fluent request builder
//!
//! Callers go through [`Dispatcher`], which holds the one adapter selected at
//! startup.

pub mod dispatch;
pub mod query;
pub mod schema;
pub mod sql;
pub mod transform;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "mongodb")]
pub mod mongo;

#[cfg(feature = "rest")]
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::{DatabaseError, ErrorBody};

pub use dispatch::{Dispatcher, FacadeState};
pub use query::{OrderBy, Operator, QueryCondition, QueryOptions, SortDirection};
pub use schema::{FieldDef, FieldType, PRIMARY_KEY, SchemaDefinition};
pub use transform::{Record, StorageValue, Transformer};

/// Outcome of `insert` / `insert_many`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inserted_id: Option<String>,
    pub inserted_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl InsertResult {
    pub fn inserted(inserted_id: Option<String>, inserted_count: u64) -> Self {
        Self {
            success: true,
            inserted_id,
            inserted_count,
            error: None,
        }
    }
}

impl From<DatabaseError> for InsertResult {
    fn from(e: DatabaseError) -> Self {
        Self {
            success: false,
            inserted_id: None,
            inserted_count: 0,
            error: Some(e.to_body()),
        }
    }
}

/// Outcome of `update` / `update_many`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub success: bool,
    pub modified_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl UpdateResult {
    pub fn modified(modified_count: u64) -> Self {
        Self {
            success: true,
            modified_count,
            error: None,
        }
    }
}

impl From<DatabaseError> for UpdateResult {
    fn from(e: DatabaseError) -> Self {
        Self {
            success: false,
            modified_count: 0,
            error: Some(e.to_body()),
        }
    }
}

/// Outcome of `delete` / `delete_many`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub success: bool,
    pub deleted_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl DeleteResult {
    pub fn deleted(deleted_count: u64) -> Self {
        Self {
            success: true,
            deleted_count,
            error: None,
        }
    }
}

impl From<DatabaseError> for DeleteResult {
    fn from(e: DatabaseError) -> Self {
        Self {
            success: false,
            deleted_count: 0,
            error: Some(e.to_body()),
        }
    }
}

/// One page of rows plus the unpaginated match count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindResult<T> {
    pub data: Vec<T>,
    pub total: u64,
}

/// Backend-agnostic CRUD contract implemented once per adapter.
#[async_trait]
pub trait Database: Send + Sync {
    /// Which backend this adapter talks to.
    fn backend(&self) -> DatabaseBackend;

    async fn insert(
        &self,
        table: &str,
        record: Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError>;

    async fn insert_many(
        &self,
        table: &str,
        records: Vec<Record>,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError>;

    async fn find_one(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Option<Record>, DatabaseError>;

    async fn find_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<FindResult<Record>, DatabaseError>;

    /// Update one row by primary key. A missing id is `NotFound` and issues no write.
    async fn update(
        &self,
        table: &str,
        id: &str,
        partial: Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<UpdateResult, DatabaseError>;

    async fn update_many(
        &self,
        table: &str,
        partial: Record,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<UpdateResult, DatabaseError>;

    async fn delete(&self, table: &str, id: &str) -> Result<DeleteResult, DatabaseError>;

    async fn delete_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<DeleteResult, DatabaseError>;

    async fn count(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<u64, DatabaseError>;

    /// Idempotently create the table/collection described by `schema`.
    async fn ensure_schema(&self, schema: &SchemaDefinition) -> Result<(), DatabaseError>;
}

/// Create the configured adapter and connect it.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "postgres")]
        DatabaseBackend::Postgres => {
            let backend = postgres::PgBackend::new(config).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            let backend = libsql::LibSqlBackend::new_local(&config.libsql_path).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "mongodb")]
        DatabaseBackend::MongoDb => {
            let backend = mongo::MongoBackend::new(config).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "rest")]
        DatabaseBackend::Rest => {
            let backend = rest::RestBackend::new(config)?;
            Ok(Arc::new(backend))
        }
        #[allow(unreachable_patterns)]
        other => Err(DatabaseError::NotConfigured(format!(
            "backend '{other}' is not compiled in; enable the '{other}' feature"
        ))),
    }
}

/// Table and column names must be plain identifiers on every backend.
pub fn validate_identifier(name: &str) -> Result<(), DatabaseError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DatabaseError::Validation(format!(
            "invalid identifier '{name}'"
        )))
    }
}

/// Assign the primary key and timestamps for a new record and check required fields.
pub(crate) fn prepare_insert(
    mut record: Record,
    schema: Option<&SchemaDefinition>,
) -> Result<(String, Record), DatabaseError> {
    let id = match record.get(PRIMARY_KEY) {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Null) | None => Uuid::new_v4().to_string(),
        Some(other) => {
            return Err(DatabaseError::Validation(format!(
                "primary key must be a non-empty string, got {other}"
            )));
        }
    };
    record.insert(PRIMARY_KEY.to_string(), Value::String(id.clone()));

    if let Some(schema) = schema {
        if schema.has_timestamps() {
            let now = Value::String(transform::format_timestamp(&Utc::now()));
            for field in ["createdAt", "updatedAt"] {
                if record.get(field).is_none_or(Value::is_null) {
                    record.insert(field.to_string(), now.clone());
                }
            }
        }
        for (name, def) in &schema.fields {
            if def.required && record.get(name).is_none_or(Value::is_null) {
                return Err(DatabaseError::Validation(format!(
                    "{}: required field '{name}' is missing",
                    schema.table_name
                )));
            }
        }
    }
    for field in record.keys() {
        validate_identifier(field)?;
    }
    Ok((id, record))
}

/// Strip the immutable primary key and refresh `updatedAt`.
pub(crate) fn prepare_update(
    mut partial: Record,
    schema: Option<&SchemaDefinition>,
) -> Result<Record, DatabaseError> {
    partial.remove(PRIMARY_KEY);
    if let Some(schema) = schema
        && schema.has_timestamps()
        && !partial.contains_key("updatedAt")
    {
        partial.insert(
            "updatedAt".to_string(),
            Value::String(transform::format_timestamp(&Utc::now())),
        );
    }
    if partial.is_empty() {
        return Err(DatabaseError::Validation(
            "update payload has no fields".to_string(),
        ));
    }
    for field in partial.keys() {
        validate_identifier(field)?;
    }
    Ok(partial)
}

/// Bulk writes must be scoped by at least one condition.
pub(crate) fn require_scoped(options: &QueryOptions, operation: &str) -> Result<(), DatabaseError> {
    options.validate()?;
    if options.conditions.is_empty() {
        return Err(DatabaseError::Validation(format!(
            "{operation} requires at least one where condition"
        )));
    }
    Ok(())
}

/// Options matching a single row by primary key.
pub(crate) fn by_id(id: &str) -> QueryOptions {
    QueryOptions::new().where_eq(PRIMARY_KEY, id).limit(1)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    fn obj(value: Value) -> Record {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn failed_envelopes_never_carry_counts() {
        let result = UpdateResult::from(DatabaseError::not_found("providers", "missing-id"));
        assert!(!result.success);
        assert_eq!(result.modified_count, 0);
        assert_eq!(result.error.as_ref().map(|e| e.code), Some(ErrorCode::NotFound));

        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["success"], false);
        assert_eq!(json["modifiedCount"], 0);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }

    #[test]
    fn failed_deletes_collapse_into_an_envelope() {
        let err: Result<DeleteResult, DatabaseError> =
            Err(DatabaseError::Validation("bad".to_string()));
        let result = err.unwrap_or_else(DeleteResult::from);
        assert!(!result.success);
        assert_eq!(result.deleted_count, 0);
        assert_eq!(
            result.error.map(|e| e.code),
            Some(ErrorCode::ValidationError)
        );
    }

    #[test]
    fn prepare_insert_assigns_id_and_timestamps() {
        let schema = SchemaDefinition::new("notes")
            .required("title", FieldType::String)
            .timestamps();
        let (id, record) =
            prepare_insert(obj(json!({ "title": "x" })), Some(&schema)).expect("prepare");
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(record["id"], json!(id));
        assert!(record["createdAt"].is_string());
        assert_eq!(record["createdAt"], record["updatedAt"]);
    }

    #[test]
    fn prepare_insert_keeps_caller_id_and_checks_required() {
        let schema = SchemaDefinition::new("notes").required("title", FieldType::String);
        let (id, _) =
            prepare_insert(obj(json!({ "id": "n1", "title": "x" })), Some(&schema)).expect("ok");
        assert_eq!(id, "n1");

        let err = prepare_insert(obj(json!({ "id": "n2" })), Some(&schema)).expect_err("missing");
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn prepare_update_drops_primary_key() {
        let partial = prepare_update(obj(json!({ "id": "other", "title": "y" })), None)
            .expect("prepare");
        assert!(!partial.contains_key("id"));
        assert!(prepare_update(obj(json!({ "id": "only" })), None).is_err());
    }

    #[test]
    fn identifiers_reject_injection() {
        assert!(validate_identifier("user_id").is_ok());
        assert!(validate_identifier("_id").is_ok());
        assert!(validate_identifier("name; DROP TABLE x").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn unscoped_bulk_writes_are_rejected() {
        let err = require_scoped(&QueryOptions::new(), "delete_many").expect_err("unscoped");
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(require_scoped(&QueryOptions::new().where_eq("a", 1), "delete_many").is_ok());
    }
}
