//! Database connection management with lazy initialization.

use std::sync::LazyLock;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;
use tokio::sync::OnceCell;

use scan_core::CoreError;

/// Global database instance using lazy initialization.
static DB: LazyLock<OnceCell<Surreal<Any>>> = LazyLock::new(OnceCell::new);

/// Database connection wrapper.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Engine endpoint: `mem://` or `rocksdb://path`
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "scan".to_string(),
            database: "orchestrator".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Read `SURREAL_ENDPOINT`, `SURREAL_NS`, `SURREAL_DB`, `SURREAL_USER`
    /// and `SURREAL_PASS`, falling back to an in-memory database. A
    /// `rocksdb://` endpoint needs the `rocksdb` feature.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let credentials = match (
            std::env::var("SURREAL_USER").ok(),
            std::env::var("SURREAL_PASS").ok(),
        ) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        Self {
            endpoint: std::env::var("SURREAL_ENDPOINT").unwrap_or(defaults.endpoint),
            namespace: std::env::var("SURREAL_NS").unwrap_or(defaults.namespace),
            database: std::env::var("SURREAL_DB").unwrap_or(defaults.database),
            credentials,
        }
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database not initialized - call init_db first")]
    NotInitialized,
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Initialize the database connection.
///
/// This should be called once at application startup before any database operations.
pub async fn init_db(config: DbConfig) -> Result<&'static Database, DbError> {
    DB.get_or_try_init(|| async {
        tracing::info!("Connecting to database: {}", config.endpoint);

        let db = connect(&config.endpoint).await?;

        if let Some((username, password)) = &config.credentials {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(&config.namespace).use_db(&config.database).await?;

        tracing::info!(
            "Connected to database: {}/{}",
            config.namespace,
            config.database
        );

        Ok(db)
    })
    .await
}

/// Get the database connection.
pub fn get_db() -> Result<&'static Database, DbError> {
    DB.get().ok_or(DbError::NotInitialized)
}

/// Liveness check used by the health endpoint.
pub async fn ping() -> Result<(), DbError> {
    get_db()?.health().await?;
    Ok(())
}
