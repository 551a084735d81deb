//! Provider credential management.
//!
//! One service covers every AI provider. Per-provider behavior is a
//! [`ProviderPolicy`] (key format) plus an injected [`ConnectionProbe`]
//! (live check against the provider's API). Keys are encrypted by the
//! [`CredentialVault`] before they reach storage and leave the service
//! masked, except through [`ProviderCredentialService::reveal_key`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::schema::providers_schema;
use crate::db::transform::format_timestamp;
use crate::db::{Dispatcher, QueryOptions, Record, SortDirection};
use crate::error::ServiceError;
use crate::services::repository::UserScopedRepository;
use crate::vault::{self, CredentialVault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Replicate,
    OpenRouter,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        Self::OpenAi,
        Self::Anthropic,
        Self::Google,
        Self::Replicate,
        Self::OpenRouter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Replicate => "replicate",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Key format accepted for this provider.
    fn key_pattern(self) -> &'static str {
        match self {
            Self::OpenAi => r"^sk-[A-Za-z0-9_\-]{20,}$",
            Self::Anthropic => r"^sk-ant-[A-Za-z0-9_\-]{20,}$",
            Self::Google => r"^AIza[0-9A-Za-z_\-]{35}$",
            Self::Replicate => r"^r8_[A-Za-z0-9]{20,}$",
            Self::OpenRouter => r"^sk-or-[A-Za-z0-9_\-]{20,}$",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| ServiceError::Validation(format!("unknown provider type '{s}'")))
    }
}

/// Outcome of the most recent connection test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Untested,
    Connected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untested => "untested",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

/// Validation rules for one provider's credentials.
#[derive(Debug, Clone)]
pub struct ProviderPolicy {
    kind: ProviderKind,
    key_pattern: Regex,
}

impl ProviderPolicy {
    pub fn new(kind: ProviderKind, key_pattern: &str) -> Result<Self, ServiceError> {
        let key_pattern = Regex::new(key_pattern).map_err(|e| {
            ServiceError::Validation(format!("invalid key pattern for {kind}: {e}"))
        })?;
        Ok(Self { kind, key_pattern })
    }

    pub fn builtin(kind: ProviderKind) -> Result<Self, ServiceError> {
        Self::new(kind, kind.key_pattern())
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn validate_key(&self, api_key: &SecretString) -> Result<(), ServiceError> {
        let key = api_key.expose_secret();
        if key.trim().is_empty() {
            return Err(ServiceError::Validation("apiKey is required".to_string()));
        }
        if !self.key_pattern.is_match(key) {
            return Err(ServiceError::Validation(format!(
                "apiKey does not look like a {} key",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Live check of a credential against its provider.
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    /// `Err` carries a human-readable failure reason.
    async fn probe(
        &self,
        kind: ProviderKind,
        api_key: &SecretString,
        base_url: Option<&str>,
    ) -> Result<(), String>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProvider {
    pub provider_type: ProviderKind,
    pub name: String,
    pub api_key: SecretString,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub settings: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProvider {
    pub name: Option<String>,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub is_active: Option<bool>,
    pub settings: Option<Value>,
}

/// Stored shape of a provider row; `api_key` is ciphertext.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredProvider {
    id: String,
    user_id: String,
    provider_type: ProviderKind,
    name: String,
    api_key: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    status: Option<ConnectionStatus>,
    #[serde(default)]
    last_tested_at: Option<String>,
    #[serde(default)]
    settings: Option<Value>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

/// Provider as returned to callers: the key is always masked.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderView {
    pub id: String,
    pub user_id: String,
    pub provider_type: ProviderKind,
    pub name: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub is_active: bool,
    pub status: ConnectionStatus,
    pub last_tested_at: Option<String>,
    pub settings: Option<Value>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

pub struct ProviderCredentialService {
    repo: UserScopedRepository,
    vault: Arc<CredentialVault>,
    policies: HashMap<ProviderKind, ProviderPolicy>,
    probe: Option<Arc<dyn ConnectionProbe>>,
}

impl fmt::Debug for ProviderCredentialService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentialService")
            .field("policies", &self.policies.keys().collect::<Vec<_>>())
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

impl ProviderCredentialService {
    /// Service with the built-in key policies for every provider.
    pub fn new(db: Arc<Dispatcher>, vault: Arc<CredentialVault>) -> Result<Self, ServiceError> {
        let policies = ProviderKind::ALL
            .into_iter()
            .map(|kind| ProviderPolicy::builtin(kind).map(|p| (kind, p)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self {
            repo: UserScopedRepository::new(db, providers_schema()),
            vault,
            policies,
            probe: None,
        })
    }

    /// Replace the policy for `policy.kind()`.
    pub fn with_policy(mut self, policy: ProviderPolicy) -> Self {
        self.policies.insert(policy.kind(), policy);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectionProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    fn policy(&self, kind: ProviderKind) -> Result<&ProviderPolicy, ServiceError> {
        self.policies
            .get(&kind)
            .ok_or_else(|| ServiceError::Validation(format!("no policy for provider {kind}")))
    }

    fn parse(record: Record) -> Result<StoredProvider, ServiceError> {
        serde_json::from_value(Value::Object(record))
            .map_err(|e| ServiceError::Validation(format!("malformed provider row: {e}")))
    }

    fn view(&self, stored: StoredProvider) -> ProviderView {
        let api_key = match self.vault.decrypt(&stored.api_key) {
            Ok(plain) => vault::mask(plain.expose_secret()),
            Err(e) => {
                tracing::warn!(id = %stored.id, error = %e, "Stored API key cannot be decrypted");
                vault::mask("")
            }
        };
        ProviderView {
            id: stored.id,
            user_id: stored.user_id,
            provider_type: stored.provider_type,
            name: stored.name,
            api_key,
            base_url: stored.base_url,
            is_active: stored.is_active.unwrap_or(true),
            status: stored.status.unwrap_or(ConnectionStatus::Untested),
            last_tested_at: stored.last_tested_at,
            settings: stored.settings,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }
    }

    fn require_name(name: &str) -> Result<(), ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::Validation("name is required".to_string()));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        user_id: &str,
        input: CreateProvider,
    ) -> Result<ProviderView, ServiceError> {
        Self::require_name(&input.name)?;
        self.policy(input.provider_type)?
            .validate_key(&input.api_key)?;

        let mut record = Map::new();
        record.insert(
            "providerType".to_string(),
            Value::String(input.provider_type.as_str().to_string()),
        );
        record.insert("name".to_string(), Value::String(input.name));
        record.insert(
            "apiKey".to_string(),
            Value::String(self.vault.encrypt(input.api_key.expose_secret())?),
        );
        if let Some(base_url) = input.base_url {
            record.insert("baseUrl".to_string(), Value::String(base_url));
        }
        record.insert(
            "isActive".to_string(),
            Value::Bool(input.is_active.unwrap_or(true)),
        );
        record.insert(
            "status".to_string(),
            Value::String(ConnectionStatus::Untested.as_str().to_string()),
        );
        if let Some(settings) = input.settings {
            record.insert("settings".to_string(), settings);
        }

        let created = self.repo.create(user_id, record).await?;
        let view = self.view(Self::parse(created)?);
        tracing::info!(id = %view.id, provider = %view.provider_type, "Created provider credential");
        Ok(view)
    }

    /// All of the user's providers, oldest first.
    pub async fn list(&self, user_id: &str) -> Result<Vec<ProviderView>, ServiceError> {
        let page = self
            .repo
            .list(
                user_id,
                QueryOptions::new().order_by("createdAt", SortDirection::Asc),
            )
            .await?;
        page.data
            .into_iter()
            .map(|record| Ok(self.view(Self::parse(record)?)))
            .collect()
    }

    pub async fn get(&self, user_id: &str, id: &str) -> Result<ProviderView, ServiceError> {
        let record = self.repo.get(user_id, id).await?;
        Ok(self.view(Self::parse(record)?))
    }

    /// Partial update. A new key is validated against the stored provider type
    /// and resets the connection status.
    pub async fn update(
        &self,
        user_id: &str,
        id: &str,
        input: UpdateProvider,
    ) -> Result<ProviderView, ServiceError> {
        let current = Self::parse(self.repo.get(user_id, id).await?)?;

        let mut partial = Map::new();
        if let Some(name) = input.name {
            Self::require_name(&name)?;
            partial.insert("name".to_string(), Value::String(name));
        }
        if let Some(api_key) = input.api_key {
            self.policy(current.provider_type)?.validate_key(&api_key)?;
            partial.insert(
                "apiKey".to_string(),
                Value::String(self.vault.encrypt(api_key.expose_secret())?),
            );
            partial.insert(
                "status".to_string(),
                Value::String(ConnectionStatus::Untested.as_str().to_string()),
            );
            partial.insert("lastTestedAt".to_string(), Value::Null);
        }
        if let Some(base_url) = input.base_url {
            partial.insert("baseUrl".to_string(), Value::String(base_url));
        }
        if let Some(is_active) = input.is_active {
            partial.insert("isActive".to_string(), Value::Bool(is_active));
        }
        if let Some(settings) = input.settings {
            partial.insert("settings".to_string(), settings);
        }
        if partial.is_empty() {
            return Err(ServiceError::Validation(
                "update has no fields to change".to_string(),
            ));
        }

        let updated = self.repo.update(user_id, id, partial).await?;
        Ok(self.view(Self::parse(updated)?))
    }

    pub async fn delete(&self, user_id: &str, id: &str) -> Result<(), ServiceError> {
        self.repo.delete(user_id, id).await?;
        tracing::info!(%id, "Deleted provider credential");
        Ok(())
    }

    /// Decrypted key for server-side use. Never log or return it to clients.
    pub async fn reveal_key(&self, user_id: &str, id: &str) -> Result<SecretString, ServiceError> {
        let stored = Self::parse(self.repo.get(user_id, id).await?)?;
        Ok(self.vault.decrypt(&stored.api_key)?)
    }

    /// Run the probe, record `status` and `lastTestedAt`, then surface a
    /// failed probe as [`ServiceError::Probe`].
    pub async fn test_connection(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<ProviderView, ServiceError> {
        let probe = self
            .probe
            .as_ref()
            .ok_or_else(|| ServiceError::Probe("no connection probe configured".to_string()))?;
        let stored = Self::parse(self.repo.get(user_id, id).await?)?;
        let api_key = self.vault.decrypt(&stored.api_key)?;

        let outcome = probe
            .probe(stored.provider_type, &api_key, stored.base_url.as_deref())
            .await;
        let status = match &outcome {
            Ok(()) => ConnectionStatus::Connected,
            Err(reason) => {
                tracing::warn!(%id, provider = %stored.provider_type, %reason, "Connection test failed");
                ConnectionStatus::Failed
            }
        };

        let mut partial = Map::new();
        partial.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
        partial.insert(
            "lastTestedAt".to_string(),
            Value::String(format_timestamp(&Utc::now())),
        );
        let updated = self.repo.update(user_id, id, partial).await?;

        outcome.map_err(ServiceError::Probe)?;
        Ok(self.view(Self::parse(updated)?))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn builtin_policies_accept_well_formed_keys() {
        let cases = [
            (ProviderKind::OpenAi, format!("sk-proj-{}", "a".repeat(40))),
            (ProviderKind::Anthropic, format!("sk-ant-{}", "x".repeat(95))),
            (ProviderKind::Google, format!("AIza{}", "B".repeat(35))),
            (ProviderKind::Replicate, format!("r8_{}", "c".repeat(37))),
            (ProviderKind::OpenRouter, format!("sk-or-v1-{}", "d".repeat(64))),
        ];
        for (kind, key) in cases {
            let policy = ProviderPolicy::builtin(kind).expect("policy");
            assert!(policy.validate_key(&secret(&key)).is_ok(), "{kind}: {key}");
        }
    }

    #[test]
    fn builtin_policies_reject_foreign_keys() {
        let anthropic = ProviderPolicy::builtin(ProviderKind::Anthropic).expect("policy");
        assert!(anthropic.validate_key(&secret("sk-short")).is_err());
        assert!(anthropic.validate_key(&secret("")).is_err());

        let google = ProviderPolicy::builtin(ProviderKind::Google).expect("policy");
        let openai_key = format!("sk-{}", "a".repeat(40));
        assert!(google.validate_key(&secret(&openai_key)).is_err());
    }

    #[test]
    fn custom_policy_with_bad_regex_is_rejected() {
        let err = ProviderPolicy::new(ProviderKind::OpenAi, "([").expect_err("bad regex");
        assert!(err.to_string().contains("invalid key pattern"));
    }

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!("OpenAI".parse::<ProviderKind>().expect("kind"), ProviderKind::OpenAi);
        assert_eq!(
            "openrouter".parse::<ProviderKind>().expect("kind"),
            ProviderKind::OpenRouter
        );
        assert!("mistral".parse::<ProviderKind>().is_err());
        let json = serde_json::to_value(ProviderKind::OpenRouter).expect("serialize");
        assert_eq!(json, "openrouter");
    }

    #[test]
    fn create_input_deserializes_from_camel_case() {
        let input: CreateProvider = serde_json::from_value(serde_json::json!({
            "providerType": "anthropic",
            "name": "Claude",
            "apiKey": "sk-ant-abc",
        }))
        .expect("deserialize");
        assert_eq!(input.provider_type, ProviderKind::Anthropic);
        assert_eq!(input.api_key.expose_secret(), "sk-ant-abc");
        assert!(!format!("{input:?}").contains("sk-ant-abc"));
    }

    #[cfg(feature = "libsql")]
    mod storage {
        use std::sync::Mutex;

        use pretty_assertions::assert_eq;

        use super::super::*;
        use crate::config::DatabaseBackend;
        use crate::db::libsql::LibSqlBackend;
        use crate::error::ErrorCode;

        /// Records every probed key and answers with a fixed outcome.
        struct RecordingProbe {
            outcome: Result<(), String>,
            seen: Mutex<Vec<(ProviderKind, String)>>,
        }

        #[async_trait]
        impl ConnectionProbe for RecordingProbe {
            async fn probe(
                &self,
                kind: ProviderKind,
                api_key: &SecretString,
                _base_url: Option<&str>,
            ) -> Result<(), String> {
                self.seen
                    .lock()
                    .expect("lock")
                    .push((kind, api_key.expose_secret().to_string()));
                self.outcome.clone()
            }
        }

        struct Fixture {
            service: ProviderCredentialService,
            db: Arc<Dispatcher>,
            _tmpdir: tempfile::TempDir,
        }

        async fn setup() -> Fixture {
            let tmpdir = tempfile::tempdir().expect("tempdir");
            let backend = LibSqlBackend::new_local(&tmpdir.path().join("providers.db"))
                .await
                .expect("backend");
            let db = Arc::new(Dispatcher::new());
            db.configure(DatabaseBackend::LibSql).expect("configure");
            db.attach(Arc::new(backend)).expect("attach");
            db.ensure_schema(&providers_schema()).await.expect("schema");
            let vault = CredentialVault::new(&SecretString::from("unit-test-key".to_string()))
                .expect("vault");
            let service =
                ProviderCredentialService::new(db.clone(), Arc::new(vault)).expect("service");
            Fixture {
                service,
                db,
                _tmpdir: tmpdir,
            }
        }

        fn anthropic_key() -> String {
            format!("sk-ant-{}", "x".repeat(95))
        }

        fn create_input(key: &str) -> CreateProvider {
            CreateProvider {
                provider_type: ProviderKind::Anthropic,
                name: "Claude".to_string(),
                api_key: SecretString::from(key.to_string()),
                base_url: None,
                is_active: None,
                settings: None,
            }
        }

        #[tokio::test]
        async fn create_then_mask() {
            let fixture = setup().await;
            let view = fixture
                .service
                .create("user-1", create_input(&anthropic_key()))
                .await
                .expect("create");
            assert_eq!(view.api_key, "sk-ant-x***xxxx");
            assert_eq!(view.status, ConnectionStatus::Untested);
            assert!(view.is_active);

            let raw = fixture
                .db
                .find_one(
                    "providers",
                    &QueryOptions::new().where_eq("id", view.id.as_str()),
                    Some(&providers_schema()),
                )
                .await
                .expect("find")
                .expect("row");
            let stored = raw["apiKey"].as_str().expect("apiKey");
            assert!(vault::is_encrypted(stored));
            assert!(!stored.contains("xxxx"));

            let revealed = fixture
                .service
                .reveal_key("user-1", &view.id)
                .await
                .expect("reveal");
            assert_eq!(revealed.expose_secret(), anthropic_key());
        }

        #[tokio::test]
        async fn invalid_key_is_never_stored() {
            let fixture = setup().await;
            let err = fixture
                .service
                .create("user-1", create_input("not-a-key"))
                .await
                .expect_err("invalid");
            assert_eq!(err.code(), ErrorCode::ValidationError);
            assert!(fixture.service.list("user-1").await.expect("list").is_empty());
        }

        #[tokio::test]
        async fn providers_are_private_to_their_owner() {
            let fixture = setup().await;
            let view = fixture
                .service
                .create("user-1", create_input(&anthropic_key()))
                .await
                .expect("create");

            let err = fixture
                .service
                .reveal_key("user-2", &view.id)
                .await
                .expect_err("foreign");
            assert_eq!(err.code(), ErrorCode::NotFound);
            assert!(fixture.service.list("user-2").await.expect("list").is_empty());
            assert_eq!(fixture.service.list("user-1").await.expect("list").len(), 1);
        }

        #[tokio::test]
        async fn key_rotation_resets_status() {
            let fixture = setup().await;
            let probe = Arc::new(RecordingProbe {
                outcome: Ok(()),
                seen: Mutex::new(Vec::new()),
            });
            let service = ProviderCredentialService::new(
                fixture.db.clone(),
                Arc::new(
                    CredentialVault::new(&SecretString::from("unit-test-key".to_string()))
                        .expect("vault"),
                ),
            )
            .expect("service")
            .with_probe(probe.clone());

            let view = service
                .create("user-1", create_input(&anthropic_key()))
                .await
                .expect("create");
            let tested = service
                .test_connection("user-1", &view.id)
                .await
                .expect("probe");
            assert_eq!(tested.status, ConnectionStatus::Connected);
            assert!(tested.last_tested_at.is_some());

            let rotated = format!("sk-ant-{}", "y".repeat(40));
            let updated = service
                .update(
                    "user-1",
                    &view.id,
                    UpdateProvider {
                        api_key: Some(SecretString::from(rotated.clone())),
                        ..UpdateProvider::default()
                    },
                )
                .await
                .expect("update");
            assert_eq!(updated.status, ConnectionStatus::Untested);
            assert_eq!(updated.last_tested_at, None);
            assert_eq!(updated.api_key, "sk-ant-y***yyyy");

            let seen = probe.seen.lock().expect("lock").clone();
            assert_eq!(seen, vec![(ProviderKind::Anthropic, anthropic_key())]);
        }

        #[tokio::test]
        async fn failed_probe_is_recorded_and_reported() {
            let fixture = setup().await;
            let service = fixture.service.with_probe(Arc::new(RecordingProbe {
                outcome: Err("401 Unauthorized".to_string()),
                seen: Mutex::new(Vec::new()),
            }));
            let view = service
                .create("user-1", create_input(&anthropic_key()))
                .await
                .expect("create");

            let err = service
                .test_connection("user-1", &view.id)
                .await
                .expect_err("probe fails");
            assert!(matches!(err, ServiceError::Probe(ref reason) if reason == "401 Unauthorized"));

            let after = service.get("user-1", &view.id).await.expect("get");
            assert_eq!(after.status, ConnectionStatus::Failed);
            assert!(after.last_tested_at.is_some());
        }

        #[tokio::test]
        async fn test_connection_without_probe_is_an_error() {
            let fixture = setup().await;
            let view = fixture
                .service
                .create("user-1", create_input(&anthropic_key()))
                .await
                .expect("create");
            let err = fixture
                .service
                .test_connection("user-1", &view.id)
                .await
                .expect_err("no probe");
            assert!(matches!(err, ServiceError::Probe(_)));
        }

        #[tokio::test]
        async fn empty_update_and_delete_semantics() {
            let fixture = setup().await;
            let view = fixture
                .service
                .create("user-1", create_input(&anthropic_key()))
                .await
                .expect("create");
            let err = fixture
                .service
                .update("user-1", &view.id, UpdateProvider::default())
                .await
                .expect_err("empty");
            assert_eq!(err.code(), ErrorCode::ValidationError);

            fixture
                .service
                .delete("user-1", &view.id)
                .await
                .expect("delete");
            let err = fixture
                .service
                .get("user-1", &view.id)
                .await
                .expect_err("gone");
            assert_eq!(err.code(), ErrorCode::NotFound);
        }
    }
}
