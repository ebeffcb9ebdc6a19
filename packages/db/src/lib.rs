//! SurrealDB integration for the scan orchestrator.
//!
//! This crate provides database connectivity and repositories for
//! persisting job records and broker deliveries.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
pub mod repositories;
mod schema;

pub use connection::{Database, DbConfig, DbError, get_db, init_db, ping};
pub use schema::init_schema;

/// Initialize the database with the given configuration.
///
/// This should be called once at application startup.
pub async fn init(config: DbConfig) -> Result<(), DbError> {
    init_db(config).await?;
    init_schema().await?;
    Ok(())
}
