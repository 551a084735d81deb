//! Configuration resolved from the environment (and `.env` via dotenvy).

pub mod helpers;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use helpers::{
    EnvSource, ProcessEnv, optional_env_any, parse_bool_env, parse_string_env, parse_usize_env,
    require_env_any,
};

/// Which storage technology backs the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    MongoDb,
    Postgres,
    LibSql,
    Rest,
}

impl DatabaseBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MongoDb => "mongodb",
            Self::Postgres => "postgres",
            Self::LibSql => "libsql",
            Self::Rest => "rest",
        }
    }
}

impl fmt::Display for DatabaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(Self::MongoDb),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "libsql" | "sqlite" | "turso" => Ok(Self::LibSql),
            "rest" | "supabase" | "postgrest" => Ok(Self::Rest),
            other => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }
}

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_MONGODB_DATABASE: &str = "polystore";

pub fn default_libsql_path() -> PathBuf {
    PathBuf::from("data").join("polystore.db")
}

/// Database connection settings for the selected backend.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub postgres_url: Option<SecretString>,
    pub pool_size: usize,
    pub mongodb_uri: Option<SecretString>,
    pub mongodb_database: String,
    pub libsql_path: PathBuf,
    pub rest_url: Option<String>,
    pub rest_service_key: Option<SecretString>,
}

impl DatabaseConfig {
    pub(crate) fn resolve(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let backend_raw = require_env_any(
            env,
            &["DATABASE_BACKEND", "DB_TYPE"],
            "one of mongodb, postgres, libsql, rest",
        )?;
        let backend = DatabaseBackend::from_str(&backend_raw)?;

        let mut config = Self {
            backend,
            postgres_url: None,
            pool_size: parse_usize_env(env, "DATABASE_POOL_SIZE", DEFAULT_POOL_SIZE)?,
            mongodb_uri: None,
            mongodb_database: parse_string_env(env, "MONGODB_DATABASE", DEFAULT_MONGODB_DATABASE),
            libsql_path: optional_env_any(env, &["LIBSQL_PATH", "SQLITE_PATH"])
                .map(PathBuf::from)
                .unwrap_or_else(default_libsql_path),
            rest_url: None,
            rest_service_key: None,
        };

        if config.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "pool size must be at least 1".to_string(),
            });
        }

        // Only the selected backend's connection settings are mandatory.
        match backend {
            DatabaseBackend::Postgres => {
                let url = require_env_any(env, &["DATABASE_URL"], "postgres connection URL")?;
                config.postgres_url = Some(SecretString::from(url));
            }
            DatabaseBackend::MongoDb => {
                let uri = require_env_any(env, &["MONGODB_URI"], "mongodb connection string")?;
                config.mongodb_uri = Some(SecretString::from(uri));
            }
            DatabaseBackend::Rest => {
                let url = require_env_any(env, &["REST_URL", "SUPABASE_URL"], "hosted REST URL")?;
                url::Url::parse(&url).map_err(|e| ConfigError::InvalidValue {
                    key: "REST_URL".to_string(),
                    message: e.to_string(),
                })?;
                let key = require_env_any(
                    env,
                    &["REST_SERVICE_KEY", "SUPABASE_SERVICE_ROLE_KEY"],
                    "service key for the hosted REST API",
                )?;
                config.rest_url = Some(url.trim_end_matches('/').to_string());
                config.rest_service_key = Some(SecretString::from(key));
            }
            DatabaseBackend::LibSql => {}
        }

        Ok(config)
    }
}

/// Key material for the credential vault.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub encryption_key: SecretString,
}

impl VaultConfig {
    /// Resolve only the vault settings, for commands that never touch a database.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv()?;
        Self::resolve(&ProcessEnv)
    }

    pub(crate) fn resolve(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let key = require_env_any(env, &["ENCRYPTION_KEY"], "key material for stored secrets")?;
        Ok(Self {
            encryption_key: SecretString::from(key),
        })
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv()?;
        Self::resolve(&ProcessEnv)
    }

    pub(crate) fn resolve(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            filter: parse_string_env(env, "RUST_LOG", "polystore=info"),
            json: parse_bool_env(env, "POLYSTORE_LOG_JSON", false)?,
        })
    }
}

/// Load `.env` into the process environment. A missing file is not an error.
pub fn load_dotenv() -> Result<(), ConfigError> {
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        return Err(ConfigError::Env(e.to_string()));
    }
    Ok(())
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub vault: VaultConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load `.env` (if present) and resolve from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv()?;
        Self::resolve(&ProcessEnv)
    }

    pub fn resolve(env: &dyn EnvSource) -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve(env)?,
            vault: VaultConfig::resolve(env)?,
            logging: LoggingConfig::resolve(env)?,
        })
    }
}
