//! `AppError` to HTTP response mapping, checked without a server.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use db::DbError;
use http_body_util::BodyExt;
use scan_api::error::AppError;
use scan_core::{CoreError, JobId};
use storage::StorageError;

async fn error_to_response(err: AppError) -> (StatusCode, serde_json::Value) {
    let response = err.into_response();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn invalid_input_returns_400() {
    let err = AppError::Core(CoreError::invalid_input("photoCount is required"));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_INPUT");
    assert_eq!(json["error"], "photoCount is required");
}

#[tokio::test]
async fn unreadable_bundle_is_invalid_input() {
    let err = AppError::Storage(StorageError::InvalidBundle("bad zip header".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn unsupported_format_returns_400() {
    let err = AppError::Core(CoreError::UnsupportedFormat("fbx".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "UNSUPPORTED_FORMAT");
}

#[tokio::test]
async fn missing_job_returns_404() {
    let err = AppError::Database(DbError::NotFound("Job not found: x".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn unfinished_job_returns_409() {
    let err = AppError::NotReady {
        job_id: JobId::new(),
        status: "running",
    };

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "NOT_READY");
    assert!(json["error"].as_str().unwrap().contains("running"));
}

#[tokio::test]
async fn failed_job_returns_422() {
    let err = AppError::JobFailed {
        job_id: JobId::new(),
        stage: "export".into(),
        message: "tool exited with 3".into(),
    };

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "JOB_FAILED");
    assert!(json["error"].as_str().unwrap().contains("export"));
}

#[tokio::test]
async fn internal_errors_are_sanitized() {
    let err = AppError::Database(DbError::Query("SELECT exploded".into()));

    let (status, json) = error_to_response(err).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["code"], "INTERNAL_ERROR");
    assert_eq!(json["error"], "An internal error occurred");
}
