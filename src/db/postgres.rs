//! PostgreSQL backend for the Database trait.
//!
//! Compiles queries with [`SqlBuilder`] (`$n` placeholders, snake_case
//! columns) and binds [`StorageValue`]s through a `ToSql` impl that adapts to
//! the column type the server inferred for each placeholder.

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{GenericClient, Manager, ManagerConfig, Pool, RecyclingMethod};
use postgres_types::{IsNull, ToSql, Type, to_sql_checked};
use secrecy::ExposeSecret;
use tokio_postgres::{NoTls, Row};

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::db::sql::{Dialect, SqlBuilder, SqlQuery};
use crate::db::transform::{StorageValue, Transformer, format_timestamp, parse_timestamp};
use crate::db::{
    Database, DeleteResult, FindResult, InsertResult, QueryCondition, QueryOptions, Record,
    SchemaDefinition, UpdateResult, PRIMARY_KEY, by_id, prepare_insert, prepare_update,
    require_scoped,
};
use crate::error::DatabaseError;

type BoxError = Box<dyn std::error::Error + Sync + Send>;

impl ToSql for StorageValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            StorageValue::Null => Ok(IsNull::Yes),
            StorageValue::Bool(b) => {
                if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    b.to_string().to_sql(ty, out)
                } else {
                    b.to_sql(ty, out)
                }
            }
            StorageValue::Integer(i) => {
                if *ty == Type::INT2 {
                    i16::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*i)?.to_sql(ty, out)
                } else if *ty == Type::FLOAT4 {
                    (*i as f32).to_sql(ty, out)
                } else if *ty == Type::FLOAT8 {
                    (*i as f64).to_sql(ty, out)
                } else if *ty == Type::BOOL {
                    (*i != 0).to_sql(ty, out)
                } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    i.to_string().to_sql(ty, out)
                } else {
                    i.to_sql(ty, out)
                }
            }
            StorageValue::Real(f) => {
                if *ty == Type::FLOAT4 {
                    (*f as f32).to_sql(ty, out)
                } else if *ty == Type::INT8 && f.fract() == 0.0 {
                    (*f as i64).to_sql(ty, out)
                } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    f.to_string().to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            StorageValue::Text(s) => {
                if *ty == Type::UUID {
                    uuid::Uuid::parse_str(s)?.to_sql(ty, out)
                } else if *ty == Type::TIMESTAMPTZ {
                    parse_timestamp(s)?.to_sql(ty, out)
                } else if *ty == Type::JSON || *ty == Type::JSONB {
                    serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out)
                } else {
                    s.as_str().to_sql(ty, out)
                }
            }
            StorageValue::Timestamp(dt) => {
                if *ty == Type::TIMESTAMP {
                    dt.naive_utc().to_sql(ty, out)
                } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
                    format_timestamp(dt).to_sql(ty, out)
                } else {
                    dt.to_sql(ty, out)
                }
            }
            StorageValue::Json(v) => {
                if *ty == Type::JSON || *ty == Type::JSONB {
                    v.to_sql(ty, out)
                } else {
                    serde_json::to_string(v)?.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn column_value(row: &Row, idx: usize) -> Result<StorageValue, DatabaseError> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(StorageValue::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| StorageValue::Integer(i64::from(v)))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| StorageValue::Integer(i64::from(v)))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(StorageValue::Integer)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?
            .map(|v| StorageValue::Real(f64::from(v)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(StorageValue::Real)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(StorageValue::Timestamp)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| StorageValue::Timestamp(v.and_utc()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(idx)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|v| StorageValue::Timestamp(v.and_utc()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<serde_json::Value>>(idx)?
            .map(StorageValue::Json)
    } else if *ty == Type::UUID {
        row.try_get::<_, Option<uuid::Uuid>>(idx)?
            .map(|v| StorageValue::Text(v.to_string()))
    } else {
        row.try_get::<_, Option<String>>(idx)
            .map_err(|_| {
                DatabaseError::Unsupported(format!(
                    "column '{}' has unsupported type {}",
                    row.columns()[idx].name(),
                    ty
                ))
            })?
            .map(StorageValue::Text)
    };
    Ok(value.unwrap_or(StorageValue::Null))
}

fn row_to_columns(row: &Row) -> Result<Vec<(String, StorageValue)>, DatabaseError> {
    (0..row.len())
        .map(|idx| Ok((row.columns()[idx].name().to_string(), column_value(row, idx)?)))
        .collect()
}

fn params(query: &SqlQuery) -> Vec<&(dyn ToSql + Sync)> {
    query
        .params
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect()
}

/// PostgreSQL database backend.
///
/// Owns a `deadpool-postgres` pool; connections are checked out per call.
pub struct PgBackend {
    pool: Pool,
    transformer: Transformer,
}

impl PgBackend {
    /// Create a new PostgreSQL backend from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config.postgres_url.as_ref().ok_or_else(|| {
            DatabaseError::NotConfigured("DATABASE_URL is required for postgres".to_string())
        })?;
        let pg_config: tokio_postgres::Config = url
            .expose_secret()
            .parse()
            .map_err(|e| DatabaseError::NotConfigured(format!("invalid DATABASE_URL: {e}")))?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| DatabaseError::backend(DatabaseBackend::Postgres, e))?;

        // Fail at startup rather than on the first request.
        let _conn = pool.get().await?;
        tracing::info!(pool_size = config.pool_size, "Connected to PostgreSQL");

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            transformer: Transformer::new(DatabaseBackend::Postgres),
        }
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    fn builder<'a>(&self, schema: Option<&'a SchemaDefinition>) -> SqlBuilder<'a> {
        SqlBuilder::new(Dialect::Postgres, schema)
    }

    async fn execute<C>(&self, conn: &C, table: &str, query: &SqlQuery) -> Result<u64, DatabaseError>
    where
        C: GenericClient + Sync,
    {
        tracing::debug!(backend = "postgres", table, sql = %query.sql, params = query.params.len(), "execute");
        Ok(conn.execute(query.sql.as_str(), &params(query)).await?)
    }

    async fn select(
        &self,
        table: &str,
        query: &SqlQuery,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Vec<Record>, DatabaseError> {
        tracing::debug!(backend = "postgres", table, sql = %query.sql, params = query.params.len(), "query");
        let conn = self.pool.get().await?;
        let rows = conn.query(query.sql.as_str(), &params(query)).await?;
        rows.iter()
            .map(|row| {
                self.transformer
                    .from_storage(row_to_columns(row)?, schema)
            })
            .collect()
    }

    async fn id_exists(&self, table: &str, id: &str) -> Result<bool, DatabaseError> {
        let query = self.builder(None).exists_by_id(table, id)?;
        let conn = self.pool.get().await?;
        let row = conn.query_opt(query.sql.as_str(), &params(&query)).await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl Database for PgBackend {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Postgres
    }

    async fn insert(
        &self,
        table: &str,
        record: Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError> {
        let (id, record) = prepare_insert(record, schema)?;
        let columns = self.transformer.to_storage(&record, schema)?;
        let query = self.builder(schema).insert(table, columns)?;
        let conn = self.pool.get().await?;
        let inserted = self.execute(&conn, table, &query).await?;
        Ok(InsertResult::inserted(Some(id), inserted))
    }

    async fn insert_many(
        &self,
        table: &str,
        records: Vec<Record>,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError> {
        if records.is_empty() {
            return Ok(InsertResult::inserted(None, 0));
        }
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let (id, record) = prepare_insert(record, schema)?;
            let columns = self.transformer.to_storage(&record, schema)?;
            prepared.push((id, self.builder(schema).insert(table, columns)?));
        }

        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        let mut inserted = 0;
        for (_, query) in &prepared {
            inserted += self.execute(&tx, table, query).await?;
        }
        tx.commit().await?;

        let first_id = prepared.into_iter().next().map(|(id, _)| id);
        Ok(InsertResult::inserted(first_id, inserted))
    }

    async fn find_one(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Option<Record>, DatabaseError> {
        let options = QueryOptions {
            limit: Some(1),
            ..options.clone()
        };
        let query = self.builder(schema).select(table, &options)?;
        Ok(self.select(table, &query, schema).await?.into_iter().next())
    }

    async fn find_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<FindResult<Record>, DatabaseError> {
        let query = self.builder(schema).select(table, options)?;
        let data = self.select(table, &query, schema).await?;
        let total = self.count(table, options, schema).await?;
        Ok(FindResult { data, total })
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        partial: Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<UpdateResult, DatabaseError> {
        let partial = prepare_update(partial, schema)?;
        if !self.id_exists(table, id).await? {
            return Err(DatabaseError::not_found(table, id));
        }
        let set = self.transformer.to_storage(&partial, schema)?;
        let query = self
            .builder(schema)
            .update(table, set, &[QueryCondition::eq(PRIMARY_KEY, id)])?;
        let conn = self.pool.get().await?;
        let modified = self.execute(&conn, table, &query).await?;
        Ok(UpdateResult::modified(modified))
    }

    async fn update_many(
        &self,
        table: &str,
        partial: Record,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<UpdateResult, DatabaseError> {
        require_scoped(options, "update_many")?;
        let partial = prepare_update(partial, schema)?;
        let set = self.transformer.to_storage(&partial, schema)?;
        let query = self
            .builder(schema)
            .update(table, set, &options.conditions)?;
        let conn = self.pool.get().await?;
        let modified = self.execute(&conn, table, &query).await?;
        Ok(UpdateResult::modified(modified))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<DeleteResult, DatabaseError> {
        let options = by_id(id);
        let query = self.builder(None).delete(table, &options.conditions)?;
        let conn = self.pool.get().await?;
        let deleted = self.execute(&conn, table, &query).await?;
        Ok(DeleteResult::deleted(deleted))
    }

    async fn delete_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<DeleteResult, DatabaseError> {
        require_scoped(options, "delete_many")?;
        let query = self.builder(schema).delete(table, &options.conditions)?;
        let conn = self.pool.get().await?;
        let deleted = self.execute(&conn, table, &query).await?;
        Ok(DeleteResult::deleted(deleted))
    }

    async fn count(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<u64, DatabaseError> {
        let query = self.builder(schema).count(table, options)?;
        tracing::debug!(backend = "postgres", table, sql = %query.sql, "count");
        let conn = self.pool.get().await?;
        let row = conn.query_one(query.sql.as_str(), &params(&query)).await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn ensure_schema(&self, schema: &SchemaDefinition) -> Result<(), DatabaseError> {
        let statements = self.builder(Some(schema)).create_table(schema)?;
        let conn = self.pool.get().await?;
        for statement in &statements {
            conn.batch_execute(statement).await?;
        }
        tracing::info!(backend = "postgres", table = %schema.table_name, "Schema ensured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: StorageValue, ty: &Type) -> (IsNull, BytesMut) {
        let mut out = BytesMut::new();
        let is_null = value.to_sql(ty, &mut out).expect("encode");
        (is_null, out)
    }

    #[test]
    fn null_binds_to_any_column_type() {
        for ty in [Type::BOOL, Type::TEXT, Type::TIMESTAMPTZ, Type::FLOAT8] {
            let (is_null, out) = encode(StorageValue::Null, &ty);
            assert!(matches!(is_null, IsNull::Yes));
            assert!(out.is_empty());
        }
    }

    #[test]
    fn integers_adapt_to_the_inferred_column_type() {
        let (_, out) = encode(StorageValue::Integer(7), &Type::INT4);
        assert_eq!(out.as_ref(), 7i32.to_be_bytes());

        let (_, out) = encode(StorageValue::Integer(7), &Type::FLOAT8);
        assert_eq!(out.as_ref(), 7f64.to_be_bytes());

        let mut out = BytesMut::new();
        assert!(
            StorageValue::Integer(i64::from(i32::MAX) + 1)
                .to_sql(&Type::INT4, &mut out)
                .is_err()
        );
    }

    #[test]
    fn json_binds_as_text_for_text_columns() {
        let (_, out) = encode(StorageValue::Json(serde_json::json!({ "a": 1 })), &Type::TEXT);
        assert_eq!(out.as_ref(), br#"{"a":1}"#);
    }
}
