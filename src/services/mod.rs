//! Application services built on the dispatch facade and the vault.

pub mod credentials;
pub mod repository;

pub use credentials::{
    ConnectionProbe, ConnectionStatus, CreateProvider, ProviderCredentialService, ProviderKind,
    ProviderPolicy, ProviderView, UpdateProvider,
};
pub use repository::{USER_FIELD, UserScopedRepository};
