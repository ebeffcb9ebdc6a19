//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Events emitted while jobs move through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    // Job events
    /// A new job was accepted and queued.
    JobSubmitted {
        job_id: JobId,
        photo_count: u32,
        timestamp: DateTime<Utc>,
    },
    /// A worker took ownership of a queued job.
    JobStarted {
        job_id: JobId,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker picked up a job that was running when its owner died.
    JobRecovered {
        job_id: JobId,
        worker_id: String,
        stage: String,
        restarted: bool,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        artifact_path: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed terminally.
    JobFailed {
        job_id: JobId,
        stage: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Stage events
    /// A stage began executing.
    StageStarted {
        job_id: JobId,
        stage: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    /// The tool reported intermediate progress.
    StageProgress {
        job_id: JobId,
        stage: String,
        current: u64,
        total: u64,
        timestamp: DateTime<Utc>,
    },
    /// A stage attempt failed and will be tried again.
    StageRetrying {
        job_id: JobId,
        stage: String,
        attempt: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    // Worker events
    /// A worker joined the pool.
    WorkerConnected {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker left the pool.
    WorkerDisconnected {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobSubmitted { timestamp, .. }
            | JobEvent::JobStarted { timestamp, .. }
            | JobEvent::JobRecovered { timestamp, .. }
            | JobEvent::JobCompleted { timestamp, .. }
            | JobEvent::JobFailed { timestamp, .. }
            | JobEvent::StageStarted { timestamp, .. }
            | JobEvent::StageProgress { timestamp, .. }
            | JobEvent::StageRetrying { timestamp, .. }
            | JobEvent::WorkerConnected { timestamp, .. }
            | JobEvent::WorkerDisconnected { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobEvent::JobSubmitted { job_id, .. }
            | JobEvent::JobStarted { job_id, .. }
            | JobEvent::JobRecovered { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::StageStarted { job_id, .. }
            | JobEvent::StageProgress { job_id, .. }
            | JobEvent::StageRetrying { job_id, .. } => Some(*job_id),
            JobEvent::WorkerConnected { .. } | JobEvent::WorkerDisconnected { .. } => None,
        }
    }

    /// Name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::JobSubmitted { .. } => "job_submitted",
            JobEvent::JobStarted { .. } => "job_started",
            JobEvent::JobRecovered { .. } => "job_recovered",
            JobEvent::JobCompleted { .. } => "job_completed",
            JobEvent::JobFailed { .. } => "job_failed",
            JobEvent::StageStarted { .. } => "stage_started",
            JobEvent::StageProgress { .. } => "stage_progress",
            JobEvent::StageRetrying { .. } => "stage_retrying",
            JobEvent::WorkerConnected { .. } => "worker_connected",
            JobEvent::WorkerDisconnected { .. } => "worker_disconnected",
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobSubmitted {
                job_id,
                photo_count,
                ..
            } => format!("Job {job_id} submitted with {photo_count} photos"),
            JobEvent::JobStarted {
                job_id, worker_id, ..
            } => format!("Job {job_id} started by {worker_id}"),
            JobEvent::JobRecovered {
                job_id,
                stage,
                restarted,
                ..
            } => {
                let how = if *restarted { "restarting" } else { "resuming" };
                format!("Job {job_id} recovered at {stage}, {how}")
            }
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {job_id} completed in {duration_ms}ms"),
            JobEvent::JobFailed {
                job_id,
                stage,
                error,
                ..
            } => format!("Job {job_id} failed at {stage}: {error}"),
            JobEvent::StageStarted {
                job_id,
                stage,
                attempt,
                ..
            } => format!("Job {job_id} stage {stage} (attempt {attempt})"),
            JobEvent::StageProgress {
                job_id,
                stage,
                current,
                total,
                ..
            } => format!("Job {job_id} stage {stage}: {current}/{total}"),
            JobEvent::StageRetrying {
                job_id,
                stage,
                attempt,
                ..
            } => format!("Job {job_id} stage {stage} retrying (attempt {attempt})"),
            JobEvent::WorkerConnected { worker_id, .. } => format!("Worker {worker_id} connected"),
            JobEvent::WorkerDisconnected { worker_id, .. } => {
                format!("Worker {worker_id} disconnected")
            }
        }
    }
}
