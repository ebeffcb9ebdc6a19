//! Submission and status/result operations behind the HTTP routes.
//!
//! The read side only ever loads whole job records; it never touches a
//! running job's workspace except to serve the original bundle.

use std::collections::BTreeMap;

use actors::{PoolHealth, WorkerPool};
use bytes::Bytes;
use chrono::Utc;
use db::repositories::{JobFilter, JobRepository};
use scan_core::{
    ArtifactFormat, CoreError, DimensionOverrides, JobEvent, JobId, JobRecord, JobStatus,
    ScanRequest, StageError,
};
use storage::{Storage, StorageError, Workspaces, inspect_bundle};
use tokio::sync::broadcast;

use crate::error::{AppError, AppResult};

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

const STATUSES: [&str; 4] = ["queued", "running", "completed", "failed"];

/// One upload as received from a client.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub bundle: Bytes,
    /// Metadata document sent next to the bundle. Falls back to the
    /// bundle's own `metadata.json`.
    pub metadata: Option<Vec<u8>>,
    pub overrides: DimensionOverrides,
}

/// Outcome of an artifact request for an existing job.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactLookup {
    Ready(Bytes),
    /// Queued or running; ask again later.
    NotReady(&'static str),
    /// Failed jobs never get an artifact.
    Failed(StageError),
}

/// Job counts per status.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct JobStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

pub struct ScanService {
    workspaces: Workspaces,
    storage: Storage,
    pool: WorkerPool,
    events: broadcast::Sender<JobEvent>,
}

impl ScanService {
    pub fn new(
        workspaces: Workspaces,
        storage: Storage,
        pool: WorkerPool,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            workspaces,
            storage,
            pool,
            events,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Validate an upload, persist it as a queued job and hand it to the
    /// broker. Nothing is stored when validation fails.
    pub async fn submit(&self, submission: Submission) -> AppResult<JobRecord> {
        let Submission {
            bundle,
            metadata,
            overrides,
        } = submission;

        if bundle.is_empty() {
            return Err(CoreError::invalid_input("bundle is empty").into());
        }
        let summary = {
            let bundle = bundle.clone();
            tokio::task::spawn_blocking(move || inspect_bundle(&bundle))
                .await
                .map_err(StorageError::from)??
        };
        if summary.image_count == 0 {
            return Err(CoreError::invalid_input(
                "bundle contains no .jpg, .jpeg or .png images",
            )
            .into());
        }

        let metadata = metadata.or(summary.metadata).ok_or_else(|| {
            CoreError::invalid_input("metadata is required, either as a field or as metadata.json")
        })?;
        let request = ScanRequest::from_metadata(&metadata, overrides)?;
        if request.photo_count as usize != summary.image_count {
            tracing::warn!(
                photo_count = request.photo_count,
                images = summary.image_count,
                "photoCount does not match the bundle"
            );
        }

        let record = JobRecord::new(request.photo_count, request.dimensions)?;
        let job_id = record.id;
        let stored = match self.workspaces.ingest(job_id, bundle).await {
            Ok(_) => JobRepository::insert(&record).await.map_err(AppError::from),
            Err(e) => Err(e.into()),
        };
        let record = match stored {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = self.workspaces.discard(job_id).await {
                    tracing::warn!(%job_id, "failed to remove unrecorded workspace: {}", cleanup);
                }
                return Err(e);
            }
        };
        tracing::info!(%job_id, photos = record.input_photo_count, "job submitted");

        // The broker adopts queued records without a delivery when it
        // starts, so the job is not lost if the pool is down right now.
        if let Err(e) = self.pool.submit(job_id).await {
            tracing::warn!(%job_id, error = %e, "job stored but not yet enqueued");
        }

        let _ = self.events.send(JobEvent::JobSubmitted {
            job_id,
            photo_count: record.input_photo_count,
            timestamp: Utc::now(),
        });
        Ok(record)
    }

    pub async fn get_status(&self, job_id: JobId) -> AppResult<JobRecord> {
        Ok(JobRepository::get(job_id).await?)
    }

    /// Bytes of a published artifact, or why there are none.
    pub async fn get_artifact(
        &self,
        job_id: JobId,
        format: ArtifactFormat,
    ) -> AppResult<ArtifactLookup> {
        let record = JobRepository::get(job_id).await?;
        match &record.status {
            JobStatus::Completed { .. } => match self.storage.fetch_artifact(job_id, format).await? {
                Some(bytes) => Ok(ArtifactLookup::Ready(bytes)),
                None => Err(AppError::InternalError(format!(
                    "completed job {job_id} has no {format} artifact"
                ))),
            },
            JobStatus::Failed { error, .. } => Ok(ArtifactLookup::Failed(error.clone())),
            status => Ok(ArtifactLookup::NotReady(status.as_str())),
        }
    }

    /// Newest jobs first.
    pub async fn list(
        &self,
        status: Option<String>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> AppResult<Vec<JobRecord>> {
        if let Some(status) = status.as_deref() {
            if !STATUSES.contains(&status) {
                return Err(CoreError::invalid_input(format!(
                    "unknown status {status}; expected one of {}",
                    STATUSES.join(", ")
                ))
                .into());
            }
        }
        let filter = JobFilter {
            status,
            limit: Some(limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)),
            offset,
        };
        Ok(JobRepository::list(filter).await?)
    }

    pub async fn stats(&self) -> AppResult<JobStats> {
        let counts = JobRepository::count_by_status().await?;
        let mut by_status: BTreeMap<String, u64> =
            STATUSES.iter().map(|s| (s.to_string(), 0)).collect();
        for (status, count) in counts {
            *by_status.entry(status).or_default() += count;
        }
        Ok(JobStats {
            total: by_status.values().sum(),
            by_status,
        })
    }

    /// The bundle exactly as it was uploaded.
    pub async fn bundle(&self, job_id: JobId) -> AppResult<Bytes> {
        JobRepository::get(job_id).await?;
        match self.workspaces.job(job_id).read_bundle().await {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::NotFound(job_id).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn health(&self) -> Health {
        let database = match db::ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "database ping failed");
                false
            }
        };
        let pool = self.pool.health().await;
        Health { database, pool }
    }
}

/// Liveness of the pieces a job needs to make progress.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Health {
    pub database: bool,
    pub pool: Option<PoolHealth>,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.database
            && self
                .pool
                .as_ref()
                .is_some_and(|p| p.broker_alive && p.workers_alive > 0)
    }
}
