//! Domain error taxonomy shared by every package.

use crate::JobId;

/// Errors raised by the job state machine and input validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// The submission was malformed; no record was created.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A state machine operation was applied out of order.
    #[error("invalid transition for job {job_id}: cannot {operation} a {status} job")]
    InvalidTransition {
        job_id: JobId,
        operation: &'static str,
        status: &'static str,
    },

    /// No job exists with this identifier.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The requested artifact format is not produced by the pipeline.
    #[error("unsupported artifact format: {0}")]
    UnsupportedFormat(String),

    /// The pipeline definition is inconsistent.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
}

impl CoreError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        CoreError::InvalidInput(msg.into())
    }
}
