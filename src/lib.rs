//! Backend-agnostic persistence core.
//!
//! One CRUD contract ([`db::Database`]) is compiled to a document store, two
//! SQL dialects and a hosted REST API. The [`db::Dispatcher`] forwards to the
//! adapter selected at startup; [`vault::CredentialVault`] encrypts provider
//! secrets before they are stored.

pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod vault;

pub use config::Config;
pub use db::{Database, Dispatcher};
pub use error::{DatabaseError, ErrorCode, ServiceError, VaultError};
pub use vault::CredentialVault;
