//! Database schema definitions using SurrealQL.

use crate::{DbError, get_db};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing database schema...");

    db.query(SCAN_JOB_SCHEMA).await?.check()?;
    db.query(DELIVERY_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job record table. The full record lives under `record`; `status` and
/// `created_ms` are copies kept for filtering and ordering.
const SCAN_JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS scan_job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS status ON scan_job TYPE string;
DEFINE FIELD IF NOT EXISTS created_ms ON scan_job TYPE int;
DEFINE FIELD IF NOT EXISTS record ON scan_job FLEXIBLE TYPE object;

DEFINE INDEX IF NOT EXISTS scan_job_status ON scan_job FIELDS status;
DEFINE INDEX IF NOT EXISTS scan_job_created ON scan_job FIELDS created_ms;
"#;

/// Broker deliveries, one per unacked job.
const DELIVERY_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS delivery SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON delivery TYPE string;
DEFINE FIELD IF NOT EXISTS delivery_count ON delivery TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS leased_by ON delivery TYPE option<string>;
DEFINE FIELD IF NOT EXISTS lease_expires_at ON delivery TYPE option<string>;
DEFINE FIELD IF NOT EXISTS enqueued_at ON delivery TYPE string;

DEFINE INDEX IF NOT EXISTS delivery_job ON delivery FIELDS job_id UNIQUE;
"#;
