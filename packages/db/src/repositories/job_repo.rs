//! Job record persistence.
//!
//! Every mutation loads the current record, applies a pure transition from
//! `scan_core` and writes the result back whole. Only the owning worker
//! mutates a running record, so the load/replace pair has a single writer.

use std::collections::HashMap;

use scan_core::{Dimensions, JobId, JobRecord, StageError};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{DbError, get_db};

const TABLE: &str = "scan_job";

/// Repository for job record operations.
pub struct JobRepository;

/// Stored shape of a job record.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    status: String,
    created_ms: i64,
    record: JobRecord,
}

impl From<&JobRecord> for JobRow {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: None,
            status: record.status.as_str().to_string(),
            created_ms: record.created_at.timestamp_millis(),
            record: record.clone(),
        }
    }
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn not_found(id: JobId) -> DbError {
    DbError::NotFound(format!("Job not found: {id}"))
}

impl JobRepository {
    /// Validate a submission and persist it as a queued record.
    pub async fn create(photo_count: u32, dimensions: Dimensions) -> Result<JobId, DbError> {
        let record = JobRecord::new(photo_count, dimensions)?;
        Self::insert(&record).await?;
        Ok(record.id)
    }

    /// Persist a freshly built record.
    pub async fn insert(record: &JobRecord) -> Result<JobRecord, DbError> {
        let db = get_db()?;

        let row: Option<JobRow> = db
            .create((TABLE, record.id.to_string()))
            .content(JobRow::from(record))
            .await?;

        row.map(|r| r.record)
            .ok_or_else(|| DbError::Query("Failed to create job".into()))
    }

    /// Get a consistent snapshot of a job.
    pub async fn get(id: JobId) -> Result<JobRecord, DbError> {
        let db = get_db()?;

        let row: Option<JobRow> = db.select((TABLE, id.to_string())).await?;

        row.map(|r| r.record).ok_or_else(|| not_found(id))
    }

    /// Replace the stored record with `record`.
    async fn replace(record: JobRecord) -> Result<JobRecord, DbError> {
        let db = get_db()?;
        let id = record.id;

        let row: Option<JobRow> = db
            .update((TABLE, id.to_string()))
            .content(JobRow::from(&record))
            .await?;

        row.map(|r| r.record).ok_or_else(|| not_found(id))
    }

    /// queued -> running, positioned on `first_stage`.
    pub async fn transition_to_running(id: JobId, first_stage: &str) -> Result<JobRecord, DbError> {
        let record = Self::get(id).await?.start(first_stage)?;
        Self::replace(record).await
    }

    /// Record the stage in progress and the new global progress value.
    pub async fn advance_stage(id: JobId, stage: &str, progress: u32) -> Result<JobRecord, DbError> {
        let record = Self::get(id).await?.advance(stage, progress)?;
        Self::replace(record).await
    }

    /// Count a crash recovery on a running record.
    pub async fn mark_recovered(id: JobId) -> Result<JobRecord, DbError> {
        let record = Self::get(id).await?.recovered()?;
        Self::replace(record).await
    }

    /// running -> completed.
    pub async fn complete(id: JobId, artifact_path: &str) -> Result<JobRecord, DbError> {
        let record = Self::get(id).await?.complete(artifact_path)?;
        Self::replace(record).await
    }

    /// running -> failed.
    pub async fn fail(id: JobId, error: StageError) -> Result<JobRecord, DbError> {
        let record = Self::get(id).await?.fail(error)?;
        Self::replace(record).await
    }

    /// List jobs, newest first.
    pub async fn list(filter: JobFilter) -> Result<Vec<JobRecord>, DbError> {
        let db = get_db()?;

        let where_clause = if filter.status.is_some() {
            "WHERE status = $status"
        } else {
            ""
        };

        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {l}"))
            .unwrap_or_default();

        let offset_clause = filter
            .offset
            .map(|o| format!("START {o}"))
            .unwrap_or_default();

        let query = format!(
            "SELECT * FROM {TABLE} {where_clause} ORDER BY created_ms DESC {limit_clause} {offset_clause}"
        );

        let mut result = db.query(&query);
        if let Some(status) = filter.status {
            result = result.bind(("status", status));
        }

        let mut response = result.await?;
        let rows: Vec<JobRow> = response.take(0)?;

        Ok(rows.into_iter().map(|r| r.record).collect())
    }

    /// Count jobs per status string.
    pub async fn count_by_status() -> Result<HashMap<String, u64>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(format!(
                "SELECT status, count() AS count FROM {TABLE} GROUP BY status"
            ))
            .await?;

        #[derive(Deserialize)]
        struct StatusCount {
            status: Option<String>,
            count: i64,
        }

        let counts: Vec<StatusCount> = result.take(0)?;

        Ok(counts
            .into_iter()
            .filter_map(|c| c.status.map(|s| (s, c.count.max(0) as u64)))
            .collect())
    }
}
