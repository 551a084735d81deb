//! Error types shared across the crate.
//!
//! Every error maps onto one machine-readable [`ErrorCode`] so callers at the
//! API boundary can build `{ success: false, error: { code, message } }`
//! envelopes without matching on driver internals.

use serde::{Deserialize, Serialize};

use crate::config::DatabaseBackend;

/// Machine-readable error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    BackendError,
    DecryptError,
    UnsupportedOperation,
    ConfigurationError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::BackendError => "BACKEND_ERROR",
            Self::DecryptError => "DECRYPT_ERROR",
            Self::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error body attached to failed result envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to read environment: {0}")]
    Env(String),
}

/// Errors raised by the database abstraction and its adapters.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("{backend} backend error: {message}")]
    Backend {
        backend: DatabaseBackend,
        message: String,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("database not configured: {0}")]
    NotConfigured(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn backend(backend: DatabaseBackend, message: impl std::fmt::Display) -> Self {
        Self::Backend {
            backend,
            message: message.to_string(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Backend { .. } | Self::Serialization(_) => ErrorCode::BackendError,
            Self::Unsupported(_) => ErrorCode::UnsupportedOperation,
            Self::NotConfigured(_) => ErrorCode::ConfigurationError,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

impl From<ConfigError> for DatabaseError {
    fn from(e: ConfigError) -> Self {
        Self::NotConfigured(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Prefer the server-side message over the generic "db error" display.
        let message = match e.as_db_error() {
            Some(db) => format!("{} ({})", db.message(), db.code().code()),
            None => e.to_string(),
        };
        Self::backend(DatabaseBackend::Postgres, message)
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::backend(DatabaseBackend::Postgres, format!("pool: {e}"))
    }
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        Self::backend(DatabaseBackend::LibSql, e)
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for DatabaseError {
    fn from(e: mongodb::error::Error) -> Self {
        Self::backend(DatabaseBackend::MongoDb, e)
    }
}

#[cfg(feature = "rest")]
impl From<reqwest::Error> for DatabaseError {
    fn from(e: reqwest::Error) -> Self {
        Self::backend(DatabaseBackend::Rest, e)
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Credential vault errors.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("encryption key is empty")]
    EmptyKey,
}

impl VaultError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decrypt(_) => ErrorCode::DecryptError,
            Self::Encrypt(_) => ErrorCode::BackendError,
            Self::EmptyKey => ErrorCode::ConfigurationError,
        }
    }
}

/// Errors surfaced by the application services.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("connection test failed: {0}")]
    Probe(String),
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Database(e) => e.code(),
            Self::Vault(e) => e.code(),
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Probe(_) => ErrorCode::BackendError,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}
