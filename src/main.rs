//! polystore CLI
//!
//! # Commands
//!
//! - `migrate` - Create every application table/collection on the configured backend
//! - `vault` - Encrypt, decrypt or mask a secret with `ENCRYPTION_KEY`
//! - `check` - Print the resolved configuration with secrets redacted

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use polystore::config::{Config, DatabaseBackend, DatabaseConfig, LoggingConfig, VaultConfig};
use polystore::db::Dispatcher;
use polystore::db::schema::all_schemas;
use polystore::error::{DatabaseError, ErrorBody, ErrorCode, ServiceError, VaultError};
use polystore::vault::{self, CredentialVault};

#[derive(Parser)]
#[command(name = "polystore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ensure all application schemas exist on the configured backend
    Migrate,

    /// Credential vault operations
    Vault {
        #[command(subcommand)]
        action: VaultAction,
    },

    /// Print the resolved configuration with secrets redacted
    Check {
        /// Also open a connection to the configured backend
        #[arg(long)]
        connect: bool,
    },
}

#[derive(Subcommand)]
enum VaultAction {
    /// Encrypt a value into `iv:ciphertext`
    Encrypt { value: String },
    /// Decrypt an `iv:ciphertext` value
    Decrypt { value: String },
    /// Print the display mask of a value
    Mask { value: String },
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("polystore=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// URL with any password replaced by `***`.
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}

fn redact_secret(secret: Option<&SecretString>) -> &'static str {
    match secret {
        Some(s) if !s.expose_secret().is_empty() => "<set>",
        _ => "<unset>",
    }
}

fn print_database(config: &DatabaseConfig) {
    println!("backend:          {}", config.backend);
    match config.backend {
        DatabaseBackend::Postgres => {
            let url = config
                .postgres_url
                .as_ref()
                .map(|u| redact_url(u.expose_secret()))
                .unwrap_or_else(|| "<unset>".to_string());
            println!("postgres url:     {url}");
            println!("pool size:        {}", config.pool_size);
        }
        DatabaseBackend::MongoDb => {
            let uri = config
                .mongodb_uri
                .as_ref()
                .map(|u| redact_url(u.expose_secret()))
                .unwrap_or_else(|| "<unset>".to_string());
            println!("mongodb uri:      {uri}");
            println!("mongodb database: {}", config.mongodb_database);
        }
        DatabaseBackend::LibSql => {
            println!("libsql path:      {}", config.libsql_path.display());
        }
        DatabaseBackend::Rest => {
            println!(
                "rest url:         {}",
                config.rest_url.as_deref().unwrap_or("<unset>")
            );
            println!(
                "rest service key: {}",
                redact_secret(config.rest_service_key.as_ref())
            );
        }
    }
}

async fn migrate() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let db = Dispatcher::connect(&config.database)
        .await
        .with_context(|| format!("failed to connect to {}", config.database.backend))?;
    for schema in all_schemas() {
        db.ensure_schema(&schema)
            .await
            .with_context(|| format!("failed to ensure schema '{}'", schema.table_name))?;
        println!("ensured {}", schema.table_name);
    }
    Ok(())
}

fn run_vault(action: VaultAction) -> anyhow::Result<()> {
    if let VaultAction::Mask { value } = &action {
        println!("{}", vault::mask(value));
        return Ok(());
    }
    let config = VaultConfig::from_env().context("failed to load vault configuration")?;
    let vault = CredentialVault::from_config(&config)?;
    match action {
        VaultAction::Encrypt { value } => println!("{}", vault.encrypt(&value)?),
        VaultAction::Decrypt { value } => println!("{}", vault.decrypt(&value)?.expose_secret()),
        VaultAction::Mask { .. } => {}
    }
    Ok(())
}

async fn check(connect: bool) -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    print_database(&config.database);
    println!(
        "encryption key:   {}",
        redact_secret(Some(&config.vault.encryption_key))
    );
    println!("log filter:       {}", config.logging.filter);
    println!("log json:         {}", config.logging.json);

    if connect {
        let db = Dispatcher::connect(&config.database)
            .await
            .with_context(|| format!("failed to connect to {}", config.database.backend))?;
        println!("connection:       ok ({:?})", db.state());
    }
    Ok(())
}

/// Error body for a failed command. The code comes from the typed error
/// underneath any context; the message keeps the whole context chain.
fn error_body(err: anyhow::Error) -> ErrorBody {
    let message = format!("{err:#}");
    let typed = match err.downcast::<ServiceError>() {
        Ok(e) => Some(e),
        Err(err) => match err.downcast::<DatabaseError>() {
            Ok(e) => Some(ServiceError::from(e)),
            Err(err) => err.downcast::<VaultError>().ok().map(ServiceError::from),
        },
    };
    let mut body = match typed {
        Some(e) => e.to_body(),
        None => ErrorBody::new(ErrorCode::ConfigurationError, String::new()),
    };
    body.message = message;
    body
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let logging = LoggingConfig::from_env().context("failed to load logging configuration")?;
    init_tracing(&logging);

    match cli.command {
        Commands::Migrate => migrate().await,
        Commands::Vault { action } => run_vault(action),
        Commands::Check { connect } => check(connect).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let envelope = json!({ "success": false, "error": error_body(err) });
            eprintln!("{envelope}");
            ExitCode::FAILURE
        }
    }
}
