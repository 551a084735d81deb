//! Dispatch facade: one adapter, selected once at startup.
//!
//! Construct a [`Dispatcher`], `configure` it with the backend type from
//! configuration, then `attach` a connected adapter. Every CRUD call before
//! that point fails fast with `CONFIGURATION_ERROR`.

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::db::{
    Database, DeleteResult, FindResult, InsertResult, QueryOptions, Record, SchemaDefinition,
    UpdateResult, connect_from_config,
};
use crate::error::DatabaseError;

/// Lifecycle of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    Uninitialized,
    Configured,
    Ready,
}

#[derive(Default)]
pub struct Dispatcher {
    backend: OnceLock<DatabaseBackend>,
    adapter: OnceLock<Arc<dyn Database>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend.get())
            .field("state", &self.state())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure from settings and connect the matching adapter.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let dispatcher = Self::new();
        dispatcher.configure(config.backend)?;
        dispatcher.attach(connect_from_config(config).await?)?;
        Ok(dispatcher)
    }

    pub fn state(&self) -> FacadeState {
        match (self.backend.get(), self.adapter.get()) {
            (_, Some(_)) => FacadeState::Ready,
            (Some(_), None) => FacadeState::Configured,
            (None, None) => FacadeState::Uninitialized,
        }
    }

    pub fn backend(&self) -> Option<DatabaseBackend> {
        self.backend.get().copied()
    }

    /// Record the backend type. Repeating the same value is a no-op.
    pub fn configure(&self, backend: DatabaseBackend) -> Result<(), DatabaseError> {
        let current = *self.backend.get_or_init(|| backend);
        if current != backend {
            return Err(DatabaseError::NotConfigured(format!(
                "backend already configured as '{current}', cannot switch to '{backend}'"
            )));
        }
        tracing::debug!(%backend, "Dispatcher configured");
        Ok(())
    }

    /// Install the adapter for the configured backend.
    pub fn attach(&self, adapter: Arc<dyn Database>) -> Result<(), DatabaseError> {
        let Some(configured) = self.backend() else {
            return Err(DatabaseError::NotConfigured(
                "configure a backend before attaching an adapter".to_string(),
            ));
        };
        if adapter.backend() != configured {
            return Err(DatabaseError::NotConfigured(format!(
                "adapter is '{}' but dispatcher is configured for '{configured}'",
                adapter.backend()
            )));
        }
        self.adapter.set(adapter).map_err(|_| {
            DatabaseError::NotConfigured("an adapter is already attached".to_string())
        })?;
        tracing::info!(backend = %configured, "Database adapter attached");
        Ok(())
    }

    fn adapter(&self) -> Result<&Arc<dyn Database>, DatabaseError> {
        self.adapter.get().ok_or_else(|| {
            DatabaseError::NotConfigured(match self.state() {
                FacadeState::Uninitialized => "database backend is not configured".to_string(),
                _ => "database adapter is not attached".to_string(),
            })
        })
    }

    pub async fn insert(
        &self,
        table: &str,
        record: Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError> {
        self.adapter()?.insert(table, record, schema).await
    }

    pub async fn insert_many(
        &self,
        table: &str,
        records: Vec<Record>,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError> {
        self.adapter()?.insert_many(table, records, schema).await
    }

    pub async fn find_one(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Option<Record>, DatabaseError> {
        self.adapter()?.find_one(table, options, schema).await
    }

    pub async fn find_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<FindResult<Record>, DatabaseError> {
        self.adapter()?.find_many(table, options, schema).await
    }

    pub async fn update(
        &self,
        table: &str,
        id: &str,
        partial: Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<UpdateResult, DatabaseError> {
        self.adapter()?.update(table, id, partial, schema).await
    }

    pub async fn update_many(
        &self,
        table: &str,
        partial: Record,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<UpdateResult, DatabaseError> {
        self.adapter()?
            .update_many(table, partial, options, schema)
            .await
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<DeleteResult, DatabaseError> {
        self.adapter()?.delete(table, id).await
    }

    pub async fn delete_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<DeleteResult, DatabaseError> {
        self.adapter()?.delete_many(table, options, schema).await
    }

    pub async fn count(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<u64, DatabaseError> {
        self.adapter()?.count(table, options, schema).await
    }

    pub async fn ensure_schema(&self, schema: &SchemaDefinition) -> Result<(), DatabaseError> {
        self.adapter()?.ensure_schema(schema).await
    }

    pub async fn find_one_as<T: DeserializeOwned>(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Option<T>, DatabaseError> {
        self.find_one(table, options, schema)
            .await?
            .map(from_record)
            .transpose()
    }

    pub async fn find_many_as<T: DeserializeOwned>(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<FindResult<T>, DatabaseError> {
        let page = self.find_many(table, options, schema).await?;
        let data = page
            .data
            .into_iter()
            .map(from_record)
            .collect::<Result<Vec<T>, _>>()?;
        Ok(FindResult {
            data,
            total: page.total,
        })
    }

    pub async fn insert_as<T: Serialize + Sync>(
        &self,
        table: &str,
        value: &T,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError> {
        self.insert(table, to_record(value)?, schema).await
    }
}

fn from_record<T: DeserializeOwned>(record: Record) -> Result<T, DatabaseError> {
    serde_json::from_value(Value::Object(record))
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn to_record<T: Serialize>(value: &T) -> Result<Record, DatabaseError> {
    match serde_json::to_value(value)? {
        Value::Object(record) => Ok(record),
        other => Err(DatabaseError::Validation(format!(
            "record must serialize to an object, got {other}"
        ))),
    }
}
