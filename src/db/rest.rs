//! Hosted REST backend (PostgREST / Supabase).
//!
//! Every call is one HTTP request against `{base}/rest/v1/{table}`. Filters
//! become PostgREST query parameters through [`RestQuery`], pagination uses
//! the `Range` header, and totals come from `Content-Range` with
//! `Prefer: count=exact`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::db::query::{Operator, QueryCondition, SortDirection};
use crate::db::schema::lookup;
use crate::db::transform::{StorageValue, Transformer, format_timestamp};
use crate::db::{
    Database, DeleteResult, FindResult, InsertResult, PRIMARY_KEY, QueryOptions, Record,
    SchemaDefinition, UpdateResult, by_id, prepare_insert, prepare_update, require_scoped,
    validate_identifier,
};
use crate::error::DatabaseError;

/// Page size used when an offset is given without a limit.
pub const DEFAULT_REST_PAGE_SIZE: u64 = 100;

/// Inclusive `(from, to)` row range for PostgREST's `Range` header.
pub fn pagination_range(offset: Option<u64>, limit: Option<u64>) -> Option<(u64, u64)> {
    match (offset, limit) {
        (Some(offset), limit) => {
            let size = limit.unwrap_or(DEFAULT_REST_PAGE_SIZE).max(1);
            Some((offset, offset.saturating_add(size - 1)))
        }
        (None, Some(limit)) => Some((0, limit.max(1) - 1)),
        (None, None) => None,
    }
}

/// Total row count from a `Content-Range` header such as `0-9/25` or `*/0`.
pub fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(parse_content_range)
}

fn literal(value: &StorageValue) -> Result<String, DatabaseError> {
    Ok(match value {
        StorageValue::Null => "null".to_string(),
        StorageValue::Bool(b) => b.to_string(),
        StorageValue::Integer(i) => i.to_string(),
        StorageValue::Real(f) => f.to_string(),
        StorageValue::Text(s) => s.clone(),
        StorageValue::Timestamp(dt) => format_timestamp(dt),
        StorageValue::Json(v) => serde_json::to_string(v)?,
    })
}

/// List items containing PostgREST delimiters are double-quoted.
fn list_item(value: &StorageValue) -> Result<String, DatabaseError> {
    let raw = literal(value)?;
    if raw.is_empty() || raw.contains([',', '(', ')', '"', '\\', ' ', '.', ':']) {
        Ok(format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\"")))
    } else {
        Ok(raw)
    }
}

fn storage_to_json(value: StorageValue) -> Value {
    match value {
        StorageValue::Null => Value::Null,
        StorageValue::Bool(b) => Value::Bool(b),
        StorageValue::Integer(i) => Value::from(i),
        StorageValue::Real(f) => Value::from(f),
        StorageValue::Text(s) => Value::String(s),
        StorageValue::Timestamp(dt) => Value::String(format_timestamp(&dt)),
        StorageValue::Json(v) => v,
    }
}

fn json_to_storage(value: Value) -> StorageValue {
    match value {
        Value::Null => StorageValue::Null,
        Value::Bool(b) => StorageValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => StorageValue::Integer(i),
            None => StorageValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => StorageValue::Text(s),
        other => StorageValue::Json(other),
    }
}

/// Fluent PostgREST query: filter parameters plus an optional row range.
///
/// Field names go through the snake_case mapper and values through the
/// REST storage rules before they are rendered.
#[derive(Debug, Clone)]
pub struct RestQuery<'a> {
    transformer: Transformer,
    schema: Option<&'a SchemaDefinition>,
    params: Vec<(String, String)>,
    order: Vec<String>,
    range: Option<(u64, u64)>,
}

impl<'a> RestQuery<'a> {
    pub fn new(schema: Option<&'a SchemaDefinition>) -> Self {
        Self {
            transformer: Transformer::new(DatabaseBackend::Rest),
            schema,
            params: Vec::new(),
            order: Vec::new(),
            range: None,
        }
    }

    /// Compile the filters, ordering, projection and pagination of `options`.
    pub fn from_options(
        options: &QueryOptions,
        schema: Option<&'a SchemaDefinition>,
    ) -> Result<Self, DatabaseError> {
        options.validate()?;
        let mut query = Self::new(schema);
        if let Some(select) = options.select.as_ref().filter(|s| !s.is_empty()) {
            let fields: Vec<&str> = select.iter().map(String::as_str).collect();
            query = query.select(&fields)?;
        }
        for condition in &options.conditions {
            query = query.condition(condition)?;
        }
        for order in &options.order_by {
            query = query.order(&order.field, order.direction)?;
        }
        if let Some((from, to)) = pagination_range(options.offset, options.limit) {
            query = query.range(from, to);
        }
        Ok(query)
    }

    fn column(&self, field: &str) -> Result<String, DatabaseError> {
        validate_identifier(field)?;
        Ok(self.transformer.storage_name(field))
    }

    fn value(&self, field: &str, value: &Value) -> Result<StorageValue, DatabaseError> {
        self.transformer
            .to_storage_value(field, lookup(self.schema, field), value)
    }

    fn filter(mut self, field: &str, expression: String) -> Result<Self, DatabaseError> {
        let column = self.column(field)?;
        self.params.push((column, expression));
        Ok(self)
    }

    fn compare(self, op: &str, field: &str, value: &Value) -> Result<Self, DatabaseError> {
        let rendered = literal(&self.value(field, value)?)?;
        self.filter(field, format!("{op}.{rendered}"))
    }

    fn list(&self, field: &str, values: &[Value]) -> Result<String, DatabaseError> {
        let items = values
            .iter()
            .map(|v| list_item(&self.value(field, v)?))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", items.join(",")))
    }

    pub fn select(mut self, fields: &[&str]) -> Result<Self, DatabaseError> {
        let columns = fields
            .iter()
            .map(|f| self.column(f))
            .collect::<Result<Vec<_>, _>>()?;
        self.params.push(("select".to_string(), columns.join(",")));
        Ok(self)
    }

    pub fn eq(self, field: &str, value: &Value) -> Result<Self, DatabaseError> {
        if value.is_null() {
            return self.is_null(field);
        }
        self.compare("eq", field, value)
    }

    pub fn neq(self, field: &str, value: &Value) -> Result<Self, DatabaseError> {
        if value.is_null() {
            return self.not_null(field);
        }
        self.compare("neq", field, value)
    }

    pub fn gt(self, field: &str, value: &Value) -> Result<Self, DatabaseError> {
        self.compare("gt", field, value)
    }

    pub fn gte(self, field: &str, value: &Value) -> Result<Self, DatabaseError> {
        self.compare("gte", field, value)
    }

    pub fn lt(self, field: &str, value: &Value) -> Result<Self, DatabaseError> {
        self.compare("lt", field, value)
    }

    pub fn lte(self, field: &str, value: &Value) -> Result<Self, DatabaseError> {
        self.compare("lte", field, value)
    }

    pub fn in_list(self, field: &str, values: &[Value]) -> Result<Self, DatabaseError> {
        let list = self.list(field, values)?;
        self.filter(field, format!("in.{list}"))
    }

    /// An empty list excludes nothing and adds no parameter.
    pub fn not_in(self, field: &str, values: &[Value]) -> Result<Self, DatabaseError> {
        if values.is_empty() {
            self.column(field)?;
            return Ok(self);
        }
        let list = self.list(field, values)?;
        self.filter(field, format!("not.in.{list}"))
    }

    /// Case-insensitive substring match. PostgREST's own `ilike` treats `%`,
    /// `_` and `*` in the needle as wildcards, so this sends `imatch` with an
    /// escaped regular expression.
    pub fn ilike(self, field: &str, needle: &str) -> Result<Self, DatabaseError> {
        self.filter(field, format!("imatch.{}", regex::escape(needle)))
    }

    pub fn is_null(self, field: &str) -> Result<Self, DatabaseError> {
        self.filter(field, "is.null".to_string())
    }

    pub fn not_null(self, field: &str) -> Result<Self, DatabaseError> {
        self.filter(field, "not.is.null".to_string())
    }

    /// Ascending sorts put nulls first, descending last.
    pub fn order(mut self, field: &str, direction: SortDirection) -> Result<Self, DatabaseError> {
        let column = self.column(field)?;
        self.order.push(match direction {
            SortDirection::Asc => format!("{column}.asc.nullsfirst"),
            SortDirection::Desc => format!("{column}.desc.nullslast"),
        });
        Ok(self)
    }

    pub fn range(mut self, from: u64, to: u64) -> Self {
        self.range = Some((from, to));
        self
    }

    pub fn condition(self, condition: &QueryCondition) -> Result<Self, DatabaseError> {
        condition.validate()?;
        let field = condition.field.as_str();
        match condition.operator {
            Operator::Eq => self.eq(field, &condition.value),
            Operator::Ne => self.neq(field, &condition.value),
            Operator::Gt => self.gt(field, &condition.value),
            Operator::Gte => self.gte(field, &condition.value),
            Operator::Lt => self.lt(field, &condition.value),
            Operator::Lte => self.lte(field, &condition.value),
            Operator::In => {
                let values = condition.list_values()?;
                self.in_list(field, values)
            }
            Operator::Nin => {
                let values = condition.list_values()?;
                self.not_in(field, values)
            }
            Operator::Like => {
                let needle = condition.like_needle()?;
                self.ilike(field, needle)
            }
            Operator::Exists => {
                if condition.exists_flag()? {
                    self.not_null(field)
                } else {
                    self.is_null(field)
                }
            }
        }
    }

    /// Query-string pairs in the order they were added, `order` last.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.params.clone();
        if !self.order.is_empty() {
            pairs.push(("order".to_string(), self.order.join(",")));
        }
        pairs
    }

    pub fn range_header(&self) -> Option<String> {
        self.range.map(|(from, to)| format!("{from}-{to}"))
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.query(&self.query_pairs());
        match self.range_header() {
            Some(range) => request.header("Range-Unit", "items").header("Range", range),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Hosted REST database backend.
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    service_key: SecretString,
    transformer: Transformer,
}

impl std::fmt::Debug for RestBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestBackend {
    pub fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let base_url = config.rest_url.clone().ok_or_else(|| {
            DatabaseError::NotConfigured("REST_URL is required for rest".to_string())
        })?;
        let service_key = config.rest_service_key.clone().ok_or_else(|| {
            DatabaseError::NotConfigured("REST_SERVICE_KEY is required for rest".to_string())
        })?;
        Self::with_client(reqwest::Client::new(), base_url, service_key)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        service_key: SecretString,
    ) -> Result<Self, DatabaseError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        url::Url::parse(&base_url)
            .map_err(|e| DatabaseError::NotConfigured(format!("invalid REST_URL: {e}")))?;
        tracing::info!(base_url = %base_url, "Configured hosted REST backend");
        Ok(Self {
            client,
            base_url,
            service_key,
            transformer: Transformer::new(DatabaseBackend::Rest),
        })
    }

    fn endpoint(&self, table: &str) -> Result<String, DatabaseError> {
        validate_identifier(table)?;
        Ok(format!("{}/rest/v1/{table}", self.base_url))
    }

    fn auth_headers(&self) -> Result<HeaderMap, DatabaseError> {
        let key = self.service_key.expose_secret();
        let invalid =
            |_| DatabaseError::NotConfigured("REST service key is not a valid header".to_string());
        let mut headers = HeaderMap::new();
        let mut apikey = HeaderValue::from_str(key).map_err(invalid)?;
        apikey.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?;
        bearer.set_sensitive(true);
        headers.insert("apikey", apikey);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);
        Ok(headers)
    }

    fn request(&self, method: Method, table: &str) -> Result<RequestBuilder, DatabaseError> {
        Ok(self
            .client
            .request(method, self.endpoint(table)?)
            .headers(self.auth_headers()?))
    }

    /// Map a non-2xx response to a backend error carrying PostgREST's message.
    async fn check(response: Response) -> Result<Response, DatabaseError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::parse_error(status, &body))
    }

    fn parse_error(status: StatusCode, body: &str) -> DatabaseError {
        match serde_json::from_str::<PostgrestError>(body) {
            Ok(err) => DatabaseError::backend(
                DatabaseBackend::Rest,
                match err.code {
                    Some(code) => format!("HTTP {status}: {} ({code})", err.message),
                    None => format!("HTTP {status}: {}", err.message),
                },
            ),
            Err(_) => DatabaseError::backend(DatabaseBackend::Rest, format!("HTTP {status}: {body}")),
        }
    }

    fn to_body(
        &self,
        record: &Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Value, DatabaseError> {
        let mut body = serde_json::Map::new();
        for (name, value) in self.transformer.to_storage(record, schema)? {
            body.insert(name, storage_to_json(value));
        }
        Ok(Value::Object(body))
    }

    async fn rows(
        &self,
        response: Response,
        schema: Option<&SchemaDefinition>,
    ) -> Result<Vec<Record>, DatabaseError> {
        let rows: Vec<serde_json::Map<String, Value>> = response.json().await?;
        rows.into_iter()
            .map(|row| {
                let columns = row
                    .into_iter()
                    .map(|(name, value)| (name, json_to_storage(value)))
                    .collect();
                self.transformer.from_storage(columns, schema)
            })
            .collect()
    }

    async fn write_returning(
        &self,
        request: RequestBuilder,
        table: &str,
    ) -> Result<usize, DatabaseError> {
        tracing::debug!(backend = "rest", table, "write");
        let response = request
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let response = Self::check(response).await?;
        let rows: Vec<Value> = response.json().await?;
        Ok(rows.len())
    }
}

#[async_trait]
impl Database for RestBackend {
    fn backend(&self) -> DatabaseBackend {
        DatabaseBackend::Rest
    }

    async fn insert(
        &self,
        table: &str,
        record: Record,
        schema: Option<&SchemaDefinition>,
    ) -> Result<InsertResult, DatabaseError> {
        let (id, record) = prepare_insert(record, schema)?;
        let body = self.to_body(&record, schema)?;
        let request = self.request(Method::POST, table)?.json(&body);
        let inserted = self.write_returning(request, table).await?;
        Ok(InsertResult::inserted(Some(id), inserted as u64))
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
        let mut bodies = Vec::with_capacity(records.len());
        for record in records {
            let (id, record) = prepare_insert(record, schema)?;
            first_id.get_or_insert(id);
            bodies.push(self.to_body(&record, schema)?);
        }
        // PostgREST inserts a JSON array in one statement.
        let request = self.request(Method::POST, table)?.json(&bodies);
        let inserted = self.write_returning(request, table).await?;
        Ok(InsertResult::inserted(first_id, inserted as u64))
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
        let query = RestQuery::from_options(&options, schema)?;
        tracing::debug!(backend = "rest", table, params = ?query.query_pairs(), "find_one");
        let response = query
            .apply(self.request(Method::GET, table)?)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(self.rows(response, schema).await?.into_iter().next())
    }

    async fn find_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<FindResult<Record>, DatabaseError> {
        let query = RestQuery::from_options(options, schema)?;
        tracing::debug!(backend = "rest", table, params = ?query.query_pairs(), range = ?query.range_header(), "find_many");
        let response = query
            .apply(self.request(Method::GET, table)?)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        // An offset past the last row answers 416 with `Content-Range: */N`.
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE
            && let Some(total) = content_range_total(&response)
        {
            tracing::debug!(backend = "rest", table, total, "Range past the end; empty page");
            return Ok(FindResult {
                data: Vec::new(),
                total,
            });
        }
        let response = Self::check(response).await?;
        let total = content_range_total(&response);
        let data = self.rows(response, schema).await?;
        let total = match total {
            Some(total) => total,
            None => {
                tracing::warn!(backend = "rest", table, "Content-Range missing; total limited to page");
                data.len() as u64
            }
        };
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
        let body = self.to_body(&partial, schema)?;
        if self.count(table, &by_id(id), schema).await? == 0 {
            return Err(DatabaseError::not_found(table, id));
        }
        let query = RestQuery::new(schema).eq(PRIMARY_KEY, &Value::String(id.to_string()))?;
        let request = query.apply(self.request(Method::PATCH, table)?).json(&body);
        let modified = self.write_returning(request, table).await?;
        if modified == 0 {
            return Err(DatabaseError::not_found(table, id));
        }
        Ok(UpdateResult::modified(modified as u64))
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
        let body = self.to_body(&partial, schema)?;
        let query = RestQuery::from_options(&options.filter_only(), schema)?;
        let request = query.apply(self.request(Method::PATCH, table)?).json(&body);
        let modified = self.write_returning(request, table).await?;
        Ok(UpdateResult::modified(modified as u64))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<DeleteResult, DatabaseError> {
        let query = RestQuery::from_options(&by_id(id).filter_only(), None)?;
        let request = query.apply(self.request(Method::DELETE, table)?);
        let deleted = self.write_returning(request, table).await?;
        Ok(DeleteResult::deleted(deleted as u64))
    }

    async fn delete_many(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<DeleteResult, DatabaseError> {
        require_scoped(options, "delete_many")?;
        let query = RestQuery::from_options(&options.filter_only(), schema)?;
        let request = query.apply(self.request(Method::DELETE, table)?);
        let deleted = self.write_returning(request, table).await?;
        Ok(DeleteResult::deleted(deleted as u64))
    }

    async fn count(
        &self,
        table: &str,
        options: &QueryOptions,
        schema: Option<&SchemaDefinition>,
    ) -> Result<u64, DatabaseError> {
        let query = RestQuery::from_options(&options.filter_only(), schema)?;
        tracing::debug!(backend = "rest", table, params = ?query.query_pairs(), "count");
        let response = query
            .apply(self.request(Method::HEAD, table)?)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = Self::check(response).await?;
        content_range_total(&response).ok_or_else(|| {
            DatabaseError::backend(DatabaseBackend::Rest, "response has no Content-Range total")
        })
    }

    /// Tables cannot be created through PostgREST; this only verifies that
    /// the table is reachable.
    async fn ensure_schema(&self, schema: &SchemaDefinition) -> Result<(), DatabaseError> {
        let table = schema.table_name.as_str();
        let response = self
            .request(Method::GET, table)?
            .query(&[("select", PRIMARY_KEY), ("limit", "1")])
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {
                tracing::info!(backend = "rest", table, "Table reachable");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(DatabaseError::Unsupported(format!(
                "table '{table}' does not exist; create it with the hosting project's migrations"
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Self::parse_error(status, &body))
            }
        }
    }
}
