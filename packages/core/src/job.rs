//! Job record and its state machine.
//!
//! A [`JobRecord`] is never mutated in place by callers. Every transition
//! consumes the current snapshot and returns the next one, which the store
//! persists with replace semantics. Readers therefore only ever observe whole
//! records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::CoreError;

/// Units in the global progress counter of every job.
pub const PROGRESS_TOTAL: u32 = 1000;

/// Unique identifier for a job, assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Always a string on the wire, whatever the serializer's human-readable flag.
impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        JobId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Physical size of the scanned object, in centimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub length: f64,
    pub width: f64,
    pub height: f64,
}

impl Dimensions {
    /// Build validated dimensions. Every side must be a positive finite number.
    pub fn new(length: f64, width: f64, height: f64) -> Result<Self, CoreError> {
        let dims = Self {
            length,
            width,
            height,
        };
        dims.validate()?;
        Ok(dims)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, value) in [
            ("length", self.length),
            ("width", self.width),
            ("height", self.height),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(CoreError::invalid_input(format!(
                    "dimension {name} must be a positive number, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Dimensions converted to meters as (length, width, height).
    pub fn in_meters(&self) -> (f64, f64, f64) {
        (self.length / 100.0, self.width / 100.0, self.height / 100.0)
    }
}

/// Global progress counter of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

impl Progress {
    pub fn new(total: u32) -> Self {
        Self { current: 0, total }
    }

    /// Move forward to `current`, never backwards and never past `total`.
    pub fn advanced_to(self, current: u32) -> Self {
        Self {
            current: current.min(self.total).max(self.current),
            total: self.total,
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64 / self.total as f64) * 100.0
        }
    }
}

/// Diagnostic detail recorded when a stage fails terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    /// Name of the stage that failed.
    pub stage: String,
    /// Human-readable failure summary.
    pub message: String,
    /// Exit code of the tool, when it ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Last lines of the tool output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
}

impl StageError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            exit_code: None,
            output_tail: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_output_tail(mut self, tail: impl Into<String>) -> Self {
        let tail = tail.into();
        self.output_tail = if tail.is_empty() { None } else { Some(tail) };
        self
    }
}

/// Current status of a job in its lifecycle.
///
/// Each variant carries exactly the fields that exist in that state, so a
/// stage is only ever present while running, an artifact only when completed
/// and an error only when failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the broker for a worker.
    #[default]
    Queued,
    /// Owned by a worker and executing `stage`.
    Running {
        started_at: DateTime<Utc>,
        stage: String,
    },
    /// All stages succeeded and the artifact is published.
    Completed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        artifact_path: String,
    },
    /// A stage failed terminally.
    Failed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: StageError,
    },
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed { .. } | JobStatus::Failed { .. })
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running { .. } => "running",
            JobStatus::Completed { .. } => "completed",
            JobStatus::Failed { .. } => "failed",
        }
    }
}

/// Durable state of one reconstruction request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(flatten)]
    pub status: JobStatus,
    pub progress: Progress,
    pub input_photo_count: u32,
    pub dimensions: Dimensions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// How many times a worker picked this job up after a crash.
    #[serde(default)]
    pub recoveries: u32,
}

impl JobRecord {
    /// Create a queued record after validating the submission.
    pub fn new(photo_count: u32, dimensions: Dimensions) -> Result<Self, CoreError> {
        if photo_count < 1 {
            return Err(CoreError::invalid_input(
                "photo count must be at least 1",
            ));
        }
        dimensions.validate()?;

        let now = Utc::now();
        Ok(Self {
            id: JobId::new(),
            status: JobStatus::Queued,
            progress: Progress::new(PROGRESS_TOTAL),
            input_photo_count: photo_count,
            dimensions,
            created_at: now,
            updated_at: now,
            recoveries: 0,
        })
    }

    pub fn current_stage(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Running { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            JobStatus::Queued => None,
            JobStatus::Running { started_at, .. }
            | JobStatus::Completed { started_at, .. }
            | JobStatus::Failed { started_at, .. } => Some(*started_at),
        }
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match &self.status {
            JobStatus::Completed { finished_at, .. } | JobStatus::Failed { finished_at, .. } => {
                Some(*finished_at)
            }
            _ => None,
        }
    }

    pub fn artifact_path(&self) -> Option<&str> {
        match &self.status {
            JobStatus::Completed { artifact_path, .. } => Some(artifact_path),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StageError> {
        match &self.status {
            JobStatus::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    fn invalid(&self, operation: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            job_id: self.id,
            operation,
            status: self.status.as_str(),
        }
    }

    /// queued -> running, positioned on the first stage.
    pub fn start(self, first_stage: impl Into<String>) -> Result<Self, CoreError> {
        if !matches!(self.status, JobStatus::Queued) {
            return Err(self.invalid("start"));
        }
        let now = Utc::now();
        Ok(Self {
            status: JobStatus::Running {
                started_at: now,
                stage: first_stage.into(),
            },
            updated_at: now,
            ..self
        })
    }

    /// Record the stage being executed and the new global progress.
    pub fn advance(self, stage: impl Into<String>, current: u32) -> Result<Self, CoreError> {
        let JobStatus::Running { started_at, .. } = self.status else {
            return Err(self.invalid("advance"));
        };
        Ok(Self {
            status: JobStatus::Running {
                started_at,
                stage: stage.into(),
            },
            progress: self.progress.advanced_to(current),
            updated_at: Utc::now(),
            ..self
        })
    }

    /// Mark a running record as recovered by a new worker after a crash.
    pub fn recovered(self) -> Result<Self, CoreError> {
        if !matches!(self.status, JobStatus::Running { .. }) {
            return Err(self.invalid("recover"));
        }
        Ok(Self {
            recoveries: self.recoveries.saturating_add(1),
            updated_at: Utc::now(),
            ..self
        })
    }

    /// running -> completed. Progress is filled up to the total.
    pub fn complete(self, artifact_path: impl Into<String>) -> Result<Self, CoreError> {
        let JobStatus::Running { started_at, .. } = self.status else {
            return Err(self.invalid("complete"));
        };
        let now = Utc::now();
        Ok(Self {
            status: JobStatus::Completed {
                started_at,
                finished_at: now,
                artifact_path: artifact_path.into(),
            },
            progress: self.progress.advanced_to(self.progress.total),
            updated_at: now,
            ..self
        })
    }

    /// running -> failed. Progress is left where the failing stage stopped.
    pub fn fail(self, error: StageError) -> Result<Self, CoreError> {
        let JobStatus::Running { started_at, .. } = self.status else {
            return Err(self.invalid("fail"));
        };
        let now = Utc::now();
        Ok(Self {
            status: JobStatus::Failed {
                started_at,
                finished_at: now,
                error,
            },
            updated_at: now,
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> Dimensions {
        Dimensions::new(50.0, 40.0, 100.0).unwrap()
    }

    #[test]
    fn new_record_is_queued() {
        let record = JobRecord::new(20, dims()).unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.progress, Progress::new(PROGRESS_TOTAL));
        assert!(record.current_stage().is_none());
        assert!(record.artifact_path().is_none());
        assert!(record.error().is_none());
    }

    #[test]
    fn rejects_invalid_submissions() {
        assert!(matches!(
            JobRecord::new(0, dims()),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(Dimensions::new(0.0, 1.0, 1.0).is_err());
        assert!(Dimensions::new(1.0, -3.0, 1.0).is_err());
        assert!(Dimensions::new(1.0, 1.0, f64::NAN).is_err());
        let bad = Dimensions {
            length: 1.0,
            width: 1.0,
            height: 0.0,
        };
        assert!(matches!(
            JobRecord::new(3, bad),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn happy_path_transitions() {
        let record = JobRecord::new(5, dims()).unwrap();
        let record = record.start("ingest-validate").unwrap();
        assert_eq!(record.current_stage(), Some("ingest-validate"));
        assert!(record.started_at().is_some());

        let record = record.advance("feature-extraction", 200).unwrap();
        assert_eq!(record.current_stage(), Some("feature-extraction"));
        assert_eq!(record.progress.current, 200);

        let record = record.complete("jobs/x/mesh.obj").unwrap();
        assert_eq!(record.status.as_str(), "completed");
        assert_eq!(record.artifact_path(), Some("jobs/x/mesh.obj"));
        assert!(record.current_stage().is_none());
        assert_eq!(record.progress.current, record.progress.total);
        assert!(record.finished_at().is_some());
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let queued = JobRecord::new(5, dims()).unwrap();
        assert!(matches!(
            queued.clone().complete("x"),
            Err(CoreError::InvalidTransition { operation: "complete", .. })
        ));
        assert!(queued.clone().advance("a", 1).is_err());
        assert!(queued.clone().fail(StageError::new("a", "b")).is_err());
        assert!(queued.clone().recovered().is_err());

        let running = queued.start("a").unwrap();
        assert!(running.clone().start("a").is_err());

        let failed = running.fail(StageError::new("a", "boom")).unwrap();
        assert!(failed.clone().start("a").is_err());
        assert!(failed.clone().complete("x").is_err());
        assert!(failed.clone().advance("a", 10).is_err());
        assert_eq!(failed.error().map(|e| e.stage.as_str()), Some("a"));
        assert!(failed.artifact_path().is_none());
    }

    #[test]
    fn progress_never_decreases_or_overflows() {
        let record = JobRecord::new(5, dims()).unwrap().start("a").unwrap();
        let record = record.advance("b", 600).unwrap();
        let record = record.advance("a", 100).unwrap();
        assert_eq!(record.progress.current, 600);
        let record = record.advance("c", PROGRESS_TOTAL + 50).unwrap();
        assert_eq!(record.progress.current, PROGRESS_TOTAL);
    }

    #[test]
    fn job_id_serializes_as_string() {
        let id = JobId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
        let back: JobId = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn status_is_flattened_into_the_record() {
        let record = JobRecord::new(5, dims()).unwrap().start("a").unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["stage"], "a");
        let back: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
