//! libSQL/SQLite backend for the Database trait.
//!
//! Column names are stored as given, booleans as `0`/`1` integers, and dates
//! and JSON as text. Each call opens a connection on the shared database
//! handle, so a file-backed database shares state across calls.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase};

use crate::config::DatabaseBackend;
use crate::db::sql::{Dialect, SqlBuilder, SqlQuery};
use crate::db::transform::{StorageValue, Transformer, format_timestamp};
use crate::db::{
    Database, DeleteResult, FindResult, InsertResult, QueryCondition, QueryOptions, Record,
    SchemaDefinition, UpdateResult, PRIMARY_KEY, by_id, prepare_insert, prepare_update,
    require_scoped,
};
use crate::error::DatabaseError;

fn to_libsql_value(value: StorageValue) -> Result<libsql::Value, DatabaseError> {
    Ok(match value {
        StorageValue::Null => libsql::Value::Null,
        StorageValue::Bool(b) => libsql::Value::Integer(i64::from(b)),
        StorageValue::Integer(i) => libsql::Value::Integer(i),
        StorageValue::Real(f) => libsql::Value::Real(f),
        StorageValue::Text(s) => libsql::Value::Text(s),
        StorageValue::Timestamp(dt) => libsql::Value::Text(format_timestamp(&dt)),
        StorageValue::Json(v) => libsql::Value::Text(serde_json::to_string(&v)?),
    })
}

fn from_libsql_value(value: libsql::Value) -> StorageValue {
    match value {
        libsql::Value::Null => StorageValue::Null,
        libsql::Value::Integer(i) => StorageValue::Integer(i),
        libsql::Value::Real(f) => StorageValue::Real(f),
        libsql::Value::Text(s) => StorageValue::Text(s),
        libsql::Value::Blob(bytes) => StorageValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn params(query: &SqlQuery) -> Result<Params, DatabaseError> {
    let values = query
        .params
        .iter()
        .cloned()
        .map(to_libsql_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Params::Positional(values))
}

fn row_to_columns(row: &libsql::Row) -> Result<Vec<(String, StorageValue)>, DatabaseError> {
    let mut columns = Vec::with_capacity(row.column_count().max(0) as usize);
    for idx in 0..row.column_count() {
        let name = row
            .column_name(idx)
            .ok_or_else(|| DatabaseError::Serialization(format!("column {idx} has no name")))?
            .to_string();
        columns.push((name, from_libsql_value(row.get_value(idx)?)));
    }
    Ok(columns)
}

/// libSQL/SQLite database backend.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    transformer: Transformer,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::backend(
                    DatabaseBackend::LibSql,
                    format!("cannot create {}: {e}", parent.display()),
                )
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await?;
        tracing::info!(path = %path.display(), "Opened libSQL database");
        Ok(Self {
            db: Arc::new(db),
            transformer: Transformer::new(DatabaseBackend::LibSql),
        })
    }

    /// Open a fresh connection on the shared database handle.
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        Ok(self.db.connect()?)
    }

    fn builder<'a>(&self, schema: Option<&'a SchemaDefinition>) -> SqlBuilder<'a> {
        SqlBuilder::new(Dialect::Sqlite, schema)
    }

    async fn execute(
        &self,
        conn: &Connection,
        table: &str,
        query: &SqlQuery,
    ) -> Result<u64, DatabaseError> {
        tracing::debug!(backend = "libsql", table, sql = %query.sql, params = query.params.len(), "execute");
        Ok(conn.execute(query.sql.as_str(), params(query)?).await?)
    }

    async fn select(
        &self,
        table: &str,
        query: &SqlQuery,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Vec<Record>, DatabaseError> {
        tracing::debug!(backend = "libsql", table, sql = %query.sql, params = query.params.len(), "query");
        let conn = self.connect().await?;
        let mut rows = conn.query(query.sql.as_str(), params(query)?).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(self.transformer.from_storage(row_to_columns(&row)?, schema)?);
        }
        Ok(records)
    }

    async fn id_exists(&self, table: &str, id: &str) -> Result<bool, DatabaseError> {
        let query = self.builder(None).exists_by_id(table, id)?;
        let conn = self.connect().await?;
        let mut rows = conn.query(query.sql.as_str(), params(&query)?).await?;
        Ok(rows.next().await?.is_some())
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::LibSql
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
        let conn = self.connect().await?;
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

        let conn = self.connect().await?;
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
        let conn = self.connect().await?;
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
        let conn = self.connect().await?;
        let modified = self.execute(&conn, table, &query).await?;
        Ok(UpdateResult::modified(modified))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<DeleteResult, DatabaseError> {
        let options = by_id(id);
        let query = self.builder(None).delete(table, &options.conditions)?;
        let conn = self.connect().await?;
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
        let conn = self.connect().await?;
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
        tracing::debug!(backend = "libsql", table, sql = %query.sql, "count");
        let conn = self.connect().await?;
        let mut rows = conn.query(query.sql.as_str(), params(&query)?).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| DatabaseError::Serialization("COUNT returned no rows".to_string()))?;
        let count: i64 = row.get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn ensure_schema(&self, schema: &SchemaDefinition) -> Result<(), DatabaseError> {
        let statements = self.builder(Some(schema)).create_table(schema)?;
        let conn = self.connect().await?;
        for statement in &statements {
            conn.execute(statement.as_str(), ()).await?;
        }
        tracing::info!(backend = "libsql", table = %schema.table_name, "Schema ensured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    use super::*;
    use crate::db::schema::{CHATS_TABLE, PROVIDERS_TABLE, chats_schema, providers_schema};
    use crate::db::SortDirection;
    use crate::error::ErrorCode;

    struct TestBackend {
        backend: LibSqlBackend,
        _tmpdir: tempfile::TempDir,
    }

    async fn setup_backend() -> TestBackend {
        // Use a temp-file database so all connections share schema/state.
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let db_path = tmpdir.path().join("polystore_test.db");
        let backend = LibSqlBackend::new_local(&db_path)
            .await
            .expect("local backend should initialize");
        for schema in [chats_schema(), providers_schema()] {
            backend
                .ensure_schema(&schema)
                .await
                .expect("schema should be created");
        }
        TestBackend {
            backend,
            _tmpdir: tmpdir,
        }
    }

    fn obj(value: Value) -> Record {
        value.as_object().cloned().expect("object literal")
    }

    async fn seed_chats(backend: &LibSqlBackend, user: &str, n: usize) {
        let schema = chats_schema();
        for i in 0..n {
            backend
                .insert(
                    CHATS_TABLE,
                    obj(json!({
                        "userId": user,
                        "title": format!("Chat {i:02}"),
                        "messageCount": i,
                        "isPinned": i % 5 == 0,
                    })),
                    Some(&schema),
                )
                .await
                .expect("insert chat");
        }
    }

    async fn count_where(backend: &LibSqlBackend, options: QueryOptions) -> u64 {
        backend
            .count(CHATS_TABLE, &options, Some(&chats_schema()))
            .await
            .expect("count")
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let fixture = setup_backend().await;
        fixture
            .backend
            .ensure_schema(&chats_schema())
            .await
            .expect("second ensure_schema should be a no-op");
    }

    #[tokio::test]
    async fn typed_fields_round_trip() {
        let fixture = setup_backend().await;
        let schema = providers_schema();
        let inserted = fixture
            .backend
            .insert(
                PROVIDERS_TABLE,
                obj(json!({
                    "userId": "u1",
                    "providerType": "openai",
                    "name": "Work key",
                    "apiKey": "cipher",
                    "isActive": true,
                    "lastTestedAt": "2025-03-01T12:30:00.250Z",
                    "settings": { "org": "acme", "retries": 3 },
                })),
                Some(&schema),
            )
            .await
            .expect("insert");
        assert!(inserted.success);
        assert_eq!(inserted.inserted_count, 1);
        let id = inserted.inserted_id.expect("generated id");

        let found = fixture
            .backend
            .find_one(PROVIDERS_TABLE, &by_id(&id), Some(&schema))
            .await
            .expect("find_one")
            .expect("row exists");
        assert_eq!(found["id"], json!(id));
        assert_eq!(found["isActive"], json!(true));
        assert_eq!(found["lastTestedAt"], json!("2025-03-01T12:30:00.250Z"));
        assert_eq!(found["settings"], json!({ "org": "acme", "retries": 3 }));
        assert!(found["createdAt"].is_string());
    }

    #[tokio::test]
    async fn pagination_reports_unpaginated_total() {
        let fixture = setup_backend().await;
        seed_chats(&fixture.backend, "u1", 25).await;
        seed_chats(&fixture.backend, "u2", 3).await;
        let schema = chats_schema();

        let page = fixture
            .backend
            .find_many(
                CHATS_TABLE,
                &QueryOptions::new()
                    .where_eq("userId", "u1")
                    .order_by("title", SortDirection::Asc)
                    .limit(10)
                    .offset(20),
                Some(&schema),
            )
            .await
            .expect("find_many");
        assert_eq!(page.total, 25);
        let titles: Vec<_> = page.data.iter().map(|r| r["title"].clone()).collect();
        assert_eq!(
            titles,
            vec![
                json!("Chat 20"),
                json!("Chat 21"),
                json!("Chat 22"),
                json!("Chat 23"),
                json!("Chat 24")
            ]
        );
    }

    #[tokio::test]
    async fn operators_filter_consistently() {
        let fixture = setup_backend().await;
        seed_chats(&fixture.backend, "u1", 10).await;
        assert_eq!(
            count_where(&fixture.backend, QueryOptions::new().filter(QueryCondition::like("title", "chat 0"))).await,
            10
        );
        assert_eq!(
            count_where(&fixture.backend, QueryOptions::new().filter(QueryCondition::in_list(
                "messageCount",
                vec![json!(1), json!(2), json!(99)]
            )))
            .await,
            2
        );
        assert_eq!(
            count_where(&fixture.backend, QueryOptions::new().filter(QueryCondition::gte("messageCount", 7))).await,
            3
        );
        assert_eq!(
            count_where(&fixture.backend, QueryOptions::new().filter(QueryCondition::eq("isPinned", true))).await,
            2
        );
        assert_eq!(
            count_where(&fixture.backend, QueryOptions::new().filter(QueryCondition::exists("model", false))).await,
            10
        );
        assert_eq!(
            count_where(&fixture.backend, QueryOptions::new().filter(QueryCondition::ne("title", "Chat 03"))).await,
            9
        );
    }

    #[tokio::test]
    async fn update_of_missing_id_is_not_found() {
        let fixture = setup_backend().await;
        let schema = chats_schema();
        let err = fixture
            .backend
            .update(
                CHATS_TABLE,
                "does-not-exist",
                obj(json!({ "title": "x" })),
                Some(&schema),
            )
            .await
            .expect_err("missing id");
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(
            fixture
                .backend
                .count(CHATS_TABLE, &QueryOptions::new(), Some(&schema))
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn update_and_delete_by_id() {
        let fixture = setup_backend().await;
        let schema = chats_schema();
        let id = fixture
            .backend
            .insert(
                CHATS_TABLE,
                obj(json!({ "id": "chat-1", "userId": "u1", "title": "Draft" })),
                Some(&schema),
            )
            .await
            .expect("insert")
            .inserted_id
            .expect("id");
        assert_eq!(id, "chat-1");

        let updated = fixture
            .backend
            .update(
                CHATS_TABLE,
                &id,
                obj(json!({ "title": "Final", "isPinned": true })),
                Some(&schema),
            )
            .await
            .expect("update");
        assert_eq!(updated.modified_count, 1);

        let row = fixture
            .backend
            .find_one(CHATS_TABLE, &by_id(&id), Some(&schema))
            .await
            .expect("find")
            .expect("row");
        assert_eq!(row["title"], json!("Final"));
        assert_eq!(row["isPinned"], json!(true));

        let deleted = fixture.backend.delete(CHATS_TABLE, &id).await.expect("delete");
        assert_eq!(deleted.deleted_count, 1);
        let again = fixture.backend.delete(CHATS_TABLE, &id).await.expect("delete");
        assert_eq!(again.deleted_count, 0);
    }

    #[tokio::test]
    async fn bulk_writes_respect_their_scope() {
        let fixture = setup_backend().await;
        seed_chats(&fixture.backend, "u1", 4).await;
        seed_chats(&fixture.backend, "u2", 2).await;
        let schema = chats_schema();
        let scope = QueryOptions::new().where_eq("userId", "u1");

        let updated = fixture
            .backend
            .update_many(CHATS_TABLE, obj(json!({ "model": "gpt-4o" })), &scope, Some(&schema))
            .await
            .expect("update_many");
        assert_eq!(updated.modified_count, 4);

        let err = fixture
            .backend
            .delete_many(CHATS_TABLE, &QueryOptions::new(), Some(&schema))
            .await
            .expect_err("unscoped delete");
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let deleted = fixture
            .backend
            .delete_many(CHATS_TABLE, &scope, Some(&schema))
            .await
            .expect("delete_many");
        assert_eq!(deleted.deleted_count, 4);
        assert_eq!(
            fixture
                .backend
                .count(CHATS_TABLE, &QueryOptions::new(), Some(&schema))
                .await
                .expect("count"),
            2
        );
    }

    #[tokio::test]
    async fn insert_many_is_all_or_nothing() {
        let fixture = setup_backend().await;
        let schema = chats_schema();
        let batch = vec![
            obj(json!({ "id": "dup", "userId": "u1" })),
            obj(json!({ "id": "other", "userId": "u1" })),
            obj(json!({ "id": "dup", "userId": "u1" })),
        ];
        assert!(
            fixture
                .backend
                .insert_many(CHATS_TABLE, batch, Some(&schema))
                .await
                .is_err()
        );
        assert_eq!(
            fixture
                .backend
                .count(CHATS_TABLE, &QueryOptions::new(), Some(&schema))
                .await
                .expect("count"),
            0
        );

        let ok = fixture
            .backend
            .insert_many(
                CHATS_TABLE,
                vec![obj(json!({ "userId": "u1" })), obj(json!({ "userId": "u1" }))],
                Some(&schema),
            )
            .await
            .expect("insert_many");
        assert_eq!(ok.inserted_count, 2);
    }
}
