//! Tenant-scoped CRUD over one schema.

use std::sync::Arc;

use serde_json::Value;

use crate::db::{
    Dispatcher, FindResult, PRIMARY_KEY, QueryCondition, QueryOptions, Record, SchemaDefinition,
};
use crate::error::ServiceError;

/// Logical field that carries the owning user.
pub const USER_FIELD: &str = "userId";

/// Every read and write is constrained to `userId = <user>`; rows owned by
/// another user are indistinguishable from missing ones.
#[derive(Debug, Clone)]
pub struct UserScopedRepository {
    db: Arc<Dispatcher>,
    schema: SchemaDefinition,
}

impl UserScopedRepository {
    pub fn new(db: Arc<Dispatcher>, schema: SchemaDefinition) -> Self {
        Self { db, schema }
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.schema
    }

    fn table(&self) -> &str {
        &self.schema.table_name
    }

    fn not_found(&self, id: &str) -> ServiceError {
        ServiceError::NotFound {
            entity: self.schema.table_name.clone(),
            id: id.to_string(),
        }
    }

    fn scoped(user_id: &str, options: QueryOptions) -> QueryOptions {
        let mut options = options;
        options
            .conditions
            .insert(0, QueryCondition::eq(USER_FIELD, user_id));
        options
    }

    fn by_id(user_id: &str, id: &str) -> QueryOptions {
        Self::scoped(user_id, QueryOptions::new().where_eq(PRIMARY_KEY, id))
    }

    /// Fails with `NotFound` unless `user_id` owns `id`; runs before any write.
    async fn ensure_owned(&self, user_id: &str, id: &str) -> Result<(), ServiceError> {
        let owned = self
            .db
            .count(self.table(), &Self::by_id(user_id, id), Some(&self.schema))
            .await?;
        if owned == 0 {
            return Err(self.not_found(id));
        }
        Ok(())
    }

    /// Insert a record owned by `user_id` and return it as stored.
    pub async fn create(&self, user_id: &str, mut record: Record) -> Result<Record, ServiceError> {
        if user_id.trim().is_empty() {
            return Err(ServiceError::Validation("user id is required".to_string()));
        }
        record.insert(USER_FIELD.to_string(), Value::String(user_id.to_string()));
        let result = self.db.insert(self.table(), record, Some(&self.schema)).await?;
        let id = result
            .inserted_id
            .ok_or_else(|| ServiceError::Validation("insert returned no id".to_string()))?;
        tracing::debug!(table = self.table(), %id, "Created scoped record");
        self.get(user_id, &id).await
    }

    pub async fn get(&self, user_id: &str, id: &str) -> Result<Record, ServiceError> {
        self.db
            .find_one(self.table(), &Self::by_id(user_id, id), Some(&self.schema))
            .await?
            .ok_or_else(|| self.not_found(id))
    }

    pub async fn list(
        &self,
        user_id: &str,
        options: QueryOptions,
    ) -> Result<FindResult<Record>, ServiceError> {
        Ok(self
            .db
            .find_many(self.table(), &Self::scoped(user_id, options), Some(&self.schema))
            .await?)
    }

    pub async fn count(&self, user_id: &str, options: QueryOptions) -> Result<u64, ServiceError> {
        Ok(self
            .db
            .count(self.table(), &Self::scoped(user_id, options), Some(&self.schema))
            .await?)
    }

    /// Apply a partial update. Ownership cannot be reassigned.
    pub async fn update(
        &self,
        user_id: &str,
        id: &str,
        mut partial: Record,
    ) -> Result<Record, ServiceError> {
        partial.remove(USER_FIELD);
        self.ensure_owned(user_id, id).await?;
        let scope = Self::by_id(user_id, id);
        let result = self
            .db
            .update_many(self.table(), partial, &scope, Some(&self.schema))
            .await?;
        if result.modified_count == 0 {
            return Err(self.not_found(id));
        }
        self.get(user_id, id).await
    }

    pub async fn delete(&self, user_id: &str, id: &str) -> Result<(), ServiceError> {
        self.ensure_owned(user_id, id).await?;
        let result = self
            .db
            .delete_many(self.table(), &Self::by_id(user_id, id), Some(&self.schema))
            .await?;
        if result.deleted_count == 0 {
            return Err(self.not_found(id));
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "libsql"))]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::config::DatabaseBackend;
    use crate::db::libsql::LibSqlBackend;
    use crate::db::schema::favorites_schema;
    use crate::db::SortDirection;
    use crate::error::ErrorCode;

    struct Fixture {
        repo: UserScopedRepository,
        _tmpdir: tempfile::TempDir,
    }

    async fn setup() -> Fixture {
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let backend = LibSqlBackend::new_local(&tmpdir.path().join("repo.db"))
            .await
            .expect("backend");
        let dispatcher = Dispatcher::new();
        dispatcher.configure(DatabaseBackend::LibSql).expect("configure");
        dispatcher.attach(Arc::new(backend)).expect("attach");
        dispatcher
            .ensure_schema(&favorites_schema())
            .await
            .expect("schema");
        Fixture {
            repo: UserScopedRepository::new(Arc::new(dispatcher), favorites_schema()),
            _tmpdir: tmpdir,
        }
    }

    fn favorite(item: &str, position: i64) -> Record {
        json!({ "itemType": "model", "itemId": item, "position": position })
            .as_object()
            .cloned()
            .expect("object")
    }

    #[tokio::test]
    async fn create_assigns_owner_id_and_timestamps() {
        let fixture = setup().await;
        let created = fixture
            .repo
            .create("alice", favorite("gpt-4o", 1))
            .await
            .expect("create");
        assert_eq!(created["userId"], json!("alice"));
        assert_eq!(created["position"], json!(1));
        let id = created["id"].as_str().expect("id");
        assert!(uuid::Uuid::parse_str(id).is_ok());
        assert!(created["createdAt"].is_string());
        assert_eq!(created["createdAt"], created["updatedAt"]);
    }

    #[tokio::test]
    async fn other_users_rows_are_not_found() {
        let fixture = setup().await;
        let created = fixture
            .repo
            .create("alice", favorite("claude", 1))
            .await
            .expect("create");
        let id = created["id"].as_str().expect("id");

        let err = fixture.repo.get("bob", id).await.expect_err("scoped");
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err = fixture
            .repo
            .update("bob", id, favorite("hijack", 9))
            .await
            .expect_err("scoped");
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err = fixture.repo.delete("bob", id).await.expect_err("scoped");
        assert_eq!(err.code(), ErrorCode::NotFound);

        let still = fixture.repo.get("alice", id).await.expect("owner");
        assert_eq!(still["itemId"], json!("claude"));
    }

    #[tokio::test]
    async fn foreign_writes_leave_the_row_untouched() {
        let fixture = setup().await;
        let created = fixture
            .repo
            .create("alice", favorite("mistral", 4))
            .await
            .expect("create");
        let id = created["id"].as_str().expect("id");

        for _ in 0..2 {
            let err = fixture
                .repo
                .update("bob", id, favorite("hijack", 9))
                .await
                .expect_err("scoped");
            assert_eq!(err.code(), ErrorCode::NotFound);
            let err = fixture.repo.delete("bob", id).await.expect_err("scoped");
            assert_eq!(err.code(), ErrorCode::NotFound);
        }
        let err = fixture
            .repo
            .update("alice", "missing-id", favorite("x", 0))
            .await
            .expect_err("missing");
        assert_eq!(err.code(), ErrorCode::NotFound);

        let after = fixture.repo.get("alice", id).await.expect("owner");
        assert_eq!(after, created);
        assert_eq!(
            fixture.repo.count("alice", QueryOptions::new()).await.expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn update_cannot_change_owner() {
        let fixture = setup().await;
        let created = fixture
            .repo
            .create("alice", favorite("gemini", 1))
            .await
            .expect("create");
        let id = created["id"].as_str().expect("id");
        let mut partial = favorite("gemini-pro", 2);
        partial.insert("userId".to_string(), json!("bob"));

        let updated = fixture.repo.update("alice", id, partial).await.expect("update");
        assert_eq!(updated["userId"], json!("alice"));
        assert_eq!(updated["itemId"], json!("gemini-pro"));
    }

    #[tokio::test]
    async fn list_and_count_only_see_own_rows() {
        let fixture = setup().await;
        for (i, item) in ["a", "b", "c"].iter().enumerate() {
            fixture
                .repo
                .create("alice", favorite(item, i as i64))
                .await
                .expect("create");
        }
        fixture
            .repo
            .create("bob", favorite("z", 0))
            .await
            .expect("create");

        let page = fixture
            .repo
            .list(
                "alice",
                QueryOptions::new()
                    .order_by("position", SortDirection::Desc)
                    .limit(2),
            )
            .await
            .expect("list");
        assert_eq!(page.total, 3);
        let items: Vec<_> = page.data.iter().map(|r| r["itemId"].clone()).collect();
        assert_eq!(items, vec![json!("c"), json!("b")]);
        assert_eq!(
            fixture.repo.count("bob", QueryOptions::new()).await.expect("count"),
            1
        );
    }
}
