use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use db::DbError;
use scan_core::{CoreError, JobId};
use serde_json::json;
use storage::StorageError;

/// Application-level error type for HTTP handlers.
///
/// Wraps the domain, database and storage errors and adds HTTP-specific
/// variants. Implements [`IntoResponse`] to produce consistent JSON error
/// responses of the form `{"error": ..., "code": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The job exists but has no artifact yet.
    #[error("job {job_id} is {status}; the artifact is not ready")]
    NotReady { job_id: JobId, status: &'static str },

    /// The job failed, so no artifact will ever exist.
    #[error("job {job_id} failed at {stage}: {message}")]
    JobFailed {
        job_id: JobId,
        stage: String,
        message: String,
    },

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify_core_error(core),
            AppError::Database(err) => classify_db_error(err),
            AppError::Storage(StorageError::InvalidBundle(msg)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                format!("invalid bundle: {msg}"),
            ),
            AppError::Storage(err) => internal(err),

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::NotReady { .. } => (StatusCode::CONFLICT, "NOT_READY", self.to_string()),
            AppError::JobFailed { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "JOB_FAILED",
                self.to_string(),
            ),
            AppError::InternalError(msg) => internal(msg),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core_error(err: &CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg.clone()),
        CoreError::UnsupportedFormat(_) => (
            StatusCode::BAD_REQUEST,
            "UNSUPPORTED_FORMAT",
            format!("{err}; use obj or ply"),
        ),
        CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        CoreError::InvalidTransition { .. } | CoreError::InvalidPipeline(_) => internal(err),
    }
}

fn classify_db_error(err: &DbError) -> (StatusCode, &'static str, String) {
    match err {
        DbError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
        DbError::Core(core) => classify_core_error(core),
        other => internal(other),
    }
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, &'static str, String) {
    tracing::error!(error = %err, "Internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
