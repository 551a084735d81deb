//! MongoDB document-store backend.
//!
//! Field names are stored as given except the primary key, which lives in
//! `_id`. Filters compile to one native filter document; see [`build_filter`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::{Client, Collection, IndexModel};
use secrecy::ExposeSecret;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::db::query::{Operator, OrderBy, QueryCondition, SortDirection};
use crate::db::schema::lookup;
use crate::db::transform::{StorageValue, Transformer};
use crate::db::{
    Database, DeleteResult, FindResult, InsertResult, PRIMARY_KEY, QueryOptions, Record,
    SchemaDefinition, UpdateResult, prepare_insert, prepare_update, require_scoped,
    validate_identifier,
};
use crate::error::DatabaseError;

const MONGO_ID: &str = "_id";

fn storage_key(field: &str) -> Result<String, DatabaseError> {
    validate_identifier(field)?;
    Ok(if field == PRIMARY_KEY {
        MONGO_ID.to_string()
    } else {
        field.to_string()
    })
}

fn to_bson(value: StorageValue) -> Result<Bson, DatabaseError> {
    Ok(match value {
        StorageValue::Null => Bson::Null,
        StorageValue::Bool(b) => Bson::Boolean(b),
        StorageValue::Integer(i) => Bson::Int64(i),
        StorageValue::Real(f) => Bson::Double(f),
        StorageValue::Text(s) => Bson::String(s),
        StorageValue::Timestamp(dt) => {
            Bson::DateTime(bson::DateTime::from_millis(dt.timestamp_millis()))
        }
        StorageValue::Json(v) => {
            bson::to_bson(&v).map_err(|e| DatabaseError::Serialization(e.to_string()))?
        }
    })
}

fn from_bson(value: Bson) -> StorageValue {
    match value {
        Bson::Null | Bson::Undefined => StorageValue::Null,
        Bson::Boolean(b) => StorageValue::Bool(b),
        Bson::Int32(i) => StorageValue::Integer(i64::from(i)),
        Bson::Int64(i) => StorageValue::Integer(i),
        Bson::Double(f) => StorageValue::Real(f),
        Bson::String(s) => StorageValue::Text(s),
        Bson::ObjectId(oid) => StorageValue::Text(oid.to_hex()),
        Bson::DateTime(dt) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
            .map(StorageValue::Timestamp)
            .unwrap_or(StorageValue::Null),
        other => StorageValue::Json(other.into_relaxed_extjson()),
    }
}

fn condition_value(
    transformer: &Transformer,
    schema: Option<&SchemaDefinition>,
    field: &str,
    value: &serde_json::Value,
) -> Result<Bson, DatabaseError> {
    to_bson(transformer.to_storage_value(field, lookup(schema, field), value)?)
}

/// Operator sub-document entries for one condition.
fn operator_entries(
    transformer: &Transformer,
    schema: Option<&SchemaDefinition>,
    condition: &QueryCondition,
) -> Result<Vec<(&'static str, Bson)>, DatabaseError> {
    let field = condition.field.as_str();
    let value = |v: &serde_json::Value| condition_value(transformer, schema, field, v);
    let list = || -> Result<Vec<Bson>, DatabaseError> {
        condition.list_values()?.iter().map(value).collect()
    };

    Ok(match condition.operator {
        Operator::Eq => vec![("$eq", value(&condition.value)?)],
        // SQL `<>` never matches NULL; mirror that.
        Operator::Ne if condition.value.is_null() => vec![("$ne", Bson::Null)],
        Operator::Ne => vec![("$nin", Bson::Array(vec![value(&condition.value)?, Bson::Null]))],
        Operator::Gt => vec![("$gt", value(&condition.value)?)],
        Operator::Gte => vec![("$gte", value(&condition.value)?)],
        Operator::Lt => vec![("$lt", value(&condition.value)?)],
        Operator::Lte => vec![("$lte", value(&condition.value)?)],
        Operator::In => vec![("$in", Bson::Array(list()?))],
        Operator::Nin => {
            let mut values = list()?;
            if values.is_empty() {
                Vec::new()
            } else {
                values.push(Bson::Null);
                vec![("$nin", Bson::Array(values))]
            }
        }
        Operator::Like => vec![
            ("$regex", Bson::String(regex::escape(condition.like_needle()?))),
            ("$options", Bson::String("i".to_string())),
        ],
        Operator::Exists => {
            if condition.exists_flag()? {
                vec![("$ne", Bson::Null)]
            } else {
                vec![("$eq", Bson::Null)]
            }
        }
    })
}

/// Compile AND-ed conditions into a filter document.
///
/// Conditions on the same field merge into one operator sub-document; a
/// lone `eq` is written as a plain `{field: value}` pair. An operator that
/// repeats on a field moves to a `$and` clause so neither bound is lost.
pub fn build_filter(
    conditions: &[QueryCondition],
    schema: Option<&SchemaDefinition>,
) -> Result<Document, DatabaseError> {
    let transformer = Transformer::new(DatabaseBackend::MongoDb);
    let mut fields: Vec<(String, Document)> = Vec::new();
    let mut overflow: Vec<Bson> = Vec::new();

    for condition in conditions {
        condition.validate()?;
        let key = storage_key(&condition.field)?;
        let entries = operator_entries(&transformer, schema, condition)?;
        if entries.is_empty() {
            continue;
        }

        let position = fields.iter().position(|(k, _)| *k == key);
        let ops = match position {
            Some(idx) => &mut fields[idx].1,
            None => {
                fields.push((key.clone(), Document::new()));
                let last = fields.len() - 1;
                &mut fields[last].1
            }
        };
        if entries.iter().any(|(op, _)| ops.contains_key(*op)) {
            let clause: Document = entries.into_iter().map(|(op, v)| (op.to_string(), v)).collect();
            let mut wrapped = Document::new();
            wrapped.insert(key, clause);
            overflow.push(Bson::Document(wrapped));
        } else {
            for (op, v) in entries {
                ops.insert(op, v);
            }
        }
    }

    let mut filter = Document::new();
    for (key, mut ops) in fields {
        if ops.is_empty() {
            continue;
        }
        if ops.len() == 1
            && let Some(value) = ops.remove("$eq")
        {
            filter.insert(key, value);
        } else {
            filter.insert(key, ops);
        }
    }
    if !overflow.is_empty() {
        filter.insert("$and", overflow);
    }
    Ok(filter)
}

/// Sort document in caller order. Ascending puts nulls first.
pub fn build_sort(order_by: &[OrderBy]) -> Result<Document, DatabaseError> {
    let mut sort = Document::new();
    for order in order_by {
        let direction = match order.direction {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        };
        sort.insert(storage_key(&order.field)?, direction);
    }
    Ok(sort)
}

fn build_projection(options: &QueryOptions) -> Result<Option<Document>, DatabaseError> {
    let Some(select) = options.select.as_ref().filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let mut projection = Document::new();
    for field in select {
        projection.insert(storage_key(field)?, 1);
    }
    if !select.contains(PRIMARY_KEY) {
        projection.insert(MONGO_ID, 0);
    }
    Ok(Some(projection))
}

/// MongoDB database backend.
pub struct MongoBackend {
    db: mongodb::Database,
    transformer: Transformer,
}

impl MongoBackend {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let uri = config.mongodb_uri.as_ref().ok_or_else(|| {
            DatabaseError::NotConfigured("MONGODB_URI is required for mongodb".to_string())
        })?;
        let client = Client::with_uri_str(uri.expose_secret()).await?;
        let db = client.database(&config.mongodb_database);
        db.run_command(doc! { "ping": 1 }).await?;
        tracing::info!(database = %config.mongodb_database, "Connected to MongoDB");
        Ok(Self::from_database(db))
    }

    pub fn from_database(db: mongodb::Database) -> Self {
        Self {
            db,
            transformer: Transformer::new(DatabaseBackend::MongoDb),
        }
    }

    fn collection(&self, table: &str) -> Result<Collection<Document>, DatabaseError> {
        validate_identifier(table)?;
        Ok(self.db.collection::<Document>(table))
    }

    fn to_document(
        &self,
        record: &Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Document, DatabaseError> {
        let mut document = Document::new();
        for (name, value) in self.transformer.to_storage(record, schema)? {
            document.insert(storage_key(&name)?, to_bson(value)?);
        }
        Ok(document)
    }

    fn to_record(
        &self,
        document: Document,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Record, DatabaseError> {
        let columns = document
            .into_iter()
            .map(|(key, value)| {
                let name = if key == MONGO_ID {
                    PRIMARY_KEY.to_string()
                } else {
                    key
                };
                (name, from_bson(value))
            })
            .collect();
        self.transformer.from_storage(columns, schema)
    }

    fn id_filter(id: &str) -> Document {
        let mut filter = Document::new();
        filter.insert(MONGO_ID, id);
        filter
    }

    async fn id_exists(&self, table: &str, id: &str) -> Result<bool, DatabaseError> {
        let found = self
            .collection(table)?
            .count_documents(Self::id_filter(id))
            .limit(1)
            .await?;
        Ok(found > 0)
    }
}

#[async_trait]
impl Database for MongoBackend {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::MongoDb
    }

    async fn insert(
        &self,
        table: &str,
        record: Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError> {
        let (id, record) = prepare_insert(record, schema)?;
        let document = self.to_document(&record, schema)?;
        tracing::debug!(backend = "mongodb", table, "insert_one");
        self.collection(table)?.insert_one(document).await?;
        Ok(InsertResult::inserted(Some(id), 1))
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
        let mut first_id = None;
        let mut documents = Vec::with_capacity(records.len());
        for record in records {
            let (id, record) = prepare_insert(record, schema)?;
            first_id.get_or_insert(id);
            documents.push(self.to_document(&record, schema)?);
        }
        tracing::debug!(backend = "mongodb", table, count = documents.len(), "insert_many");
        let result = self.collection(table)?.insert_many(documents).await?;
        Ok(InsertResult::inserted(first_id, result.inserted_ids.len() as u64))
    }

    async fn find_one(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Option<Record>, DatabaseError> {
        options.validate()?;
        let filter = build_filter(&options.conditions, schema)?;
        tracing::debug!(backend = "mongodb", table, %filter, "find_one");
        let collection = self.collection(table)?;
        let mut action = collection
            .find_one(filter)
            .sort(build_sort(&options.order_by)?)
            .skip(options.offset.unwrap_or(0));
        if let Some(projection) = build_projection(options)? {
            action = action.projection(projection);
        }
        action
            .await?
            .map(|document| self.to_record(document, schema))
            .transpose()
    }

    async fn find_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<FindResult<Record>, DatabaseError> {
        options.validate()?;
        let filter = build_filter(&options.conditions, schema)?;
        tracing::debug!(backend = "mongodb", table, %filter, "find");
        let collection = self.collection(table)?;
        let mut action = collection
            .find(filter.clone())
            .sort(build_sort(&options.order_by)?);
        if let Some(offset) = options.offset {
            action = action.skip(offset);
        }
        if let Some(limit) = options.limit {
            action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(projection) = build_projection(options)? {
            action = action.projection(projection);
        }
        let documents: Vec<Document> = action.await?.try_collect().await?;
        let data = documents
            .into_iter()
            .map(|document| self.to_record(document, schema))
            .collect::<Result<Vec<_>, _>>()?;
        let total = collection.count_documents(filter).await?;
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
        let set = self.to_document(&partial, schema)?;
        if !self.id_exists(table, id).await? {
            return Err(DatabaseError::not_found(table, id));
        }
        tracing::debug!(backend = "mongodb", table, id, "update_one");
        let result = self
            .collection(table)?
            .update_one(Self::id_filter(id), doc! { "$set": set })
            .await?;
        if result.matched_count == 0 {
            return Err(DatabaseError::not_found(table, id));
        }
        Ok(UpdateResult::modified(result.matched_count))
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
        let filter = build_filter(&options.conditions, schema)?;
        let set = self.to_document(&partial, schema)?;
        tracing::debug!(backend = "mongodb", table, %filter, "update_many");
        let result = self
            .collection(table)?
            .update_many(filter, doc! { "$set": set })
            .await?;
        Ok(UpdateResult::modified(result.matched_count))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<DeleteResult, DatabaseError> {
        tracing::debug!(backend = "mongodb", table, id, "delete_one");
        let result = self
            .collection(table)?
            .delete_one(Self::id_filter(id))
            .await?;
        Ok(DeleteResult::deleted(result.deleted_count))
    }

    async fn delete_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<DeleteResult, DatabaseError> {
        require_scoped(options, "delete_many")?;
        let filter = build_filter(&options.conditions, schema)?;
        tracing::debug!(backend = "mongodb", table, %filter, "delete_many");
        let result = self.collection(table)?.delete_many(filter).await?;
        Ok(DeleteResult::deleted(result.deleted_count))
    }

    async fn count(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<u64, DatabaseError> {
        options.validate()?;
        let filter = build_filter(&options.conditions, schema)?;
        tracing::debug!(backend = "mongodb", table, %filter, "count_documents");
        Ok(self.collection(table)?.count_documents(filter).await?)
    }

    async fn ensure_schema(&self, schema: &SchemaDefinition) -> Result<(), DatabaseError> {
        let collection = self.collection(&schema.table_name)?;
        let existing = self.db.list_collection_names().await?;
        if !existing.iter().any(|name| *name == schema.table_name) {
            self.db.create_collection(&schema.table_name).await?;
            tracing::info!(backend = "mongodb", collection = %schema.table_name, "Created collection");
        }
        if schema.field_type("userId").is_some() {
            let index = IndexModel::builder().keys(doc! { "userId": 1 }).build();
            collection.create_index(index).await?;
        }
        Ok(())
    }
}
