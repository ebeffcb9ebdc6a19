//! Job submission and status/result handlers.

use axum::Json;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use scan_core::{
    ArtifactFormat, CoreError, DimensionOverrides, Dimensions, JobId, JobRecord, StageError,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::service::{ArtifactLookup, JobStats, Submission};
use crate::state::AppState;

/// Progress as shown to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    pub current: u32,
    pub total: u32,
    pub percent: f64,
}

/// Status document of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: &'static str,
    /// Stage in progress, or the stage that failed.
    pub stage: Option<String>,
    pub progress: ProgressView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    pub photo_count: u32,
    pub dimensions: Dimensions,
    pub recoveries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for JobStatusResponse {
    fn from(record: JobRecord) -> Self {
        let error = record.error().cloned();
        let stage = record
            .current_stage()
            .map(str::to_string)
            .or_else(|| error.as_ref().map(|e| e.stage.clone()));
        Self {
            job_id: record.id,
            status: record.status.as_str(),
            stage,
            progress: ProgressView {
                current: record.progress.current,
                total: record.progress.total,
                percent: (record.progress.percent() * 10.0).round() / 10.0,
            },
            error,
            artifact_path: record.artifact_path().map(str::to_string),
            photo_count: record.input_photo_count,
            dimensions: record.dimensions,
            recoveries: record.recoveries,
            created_at: record.created_at,
            started_at: record.started_at(),
            finished_at: record.finished_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobStatusResponse>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ArtifactParams {
    pub format: Option<String>,
}

fn parse_job_id(raw: &str) -> AppResult<JobId> {
    JobId::parse(raw)
        .map_err(|_| CoreError::invalid_input(format!("invalid job id: {raw}")).into())
}

fn parse_dimension(name: &str, raw: &str) -> AppResult<f64> {
    raw.trim().parse::<f64>().map_err(|_| {
        CoreError::invalid_input(format!("{name} is not a number: {raw}")).into()
    })
}

/// Read the upload form. `zipfile` is accepted as an alias of `bundle`.
async fn read_submission(mut multipart: Multipart) -> AppResult<Submission> {
    let mut bundle: Option<Bytes> = None;
    let mut metadata = None;
    let mut overrides = DimensionOverrides::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;

        match name.as_str() {
            "bundle" | "zipfile" => bundle = Some(data),
            "metadata" => metadata = Some(data.to_vec()),
            "length" | "width" | "height" => {
                let text = String::from_utf8_lossy(&data);
                let value = parse_dimension(&name, &text)?;
                match name.as_str() {
                    "length" => overrides.length = Some(value),
                    "width" => overrides.width = Some(value),
                    _ => overrides.height = Some(value),
                }
            }
            other => tracing::debug!(field = other, "ignoring unknown upload field"),
        }
    }

    let bundle = bundle.ok_or_else(|| CoreError::invalid_input("bundle file is required"))?;
    Ok(Submission {
        bundle,
        metadata,
        overrides,
    })
}

/// POST /jobs
pub async fn submit_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    let submission = read_submission(multipart).await?;
    let record = state.service.submit(submission).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            job_id: record.id,
            status: record.status.as_str(),
        }),
    ))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<JobStatusResponse>> {
    let job_id = parse_job_id(&id)?;
    let record = state.service.get_status(job_id).await?;
    Ok(Json(record.into()))
}

/// GET /jobs/{id}/artifact?format=obj|ply
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ArtifactParams>,
) -> AppResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    let format: ArtifactFormat = params.format.as_deref().unwrap_or("obj").parse()?;

    match state.service.get_artifact(job_id, format).await? {
        ArtifactLookup::Ready(bytes) => {
            let disposition = format!("attachment; filename=\"model_{job_id}.{format}\"");
            Ok((
                [
                    (header::CONTENT_TYPE, format.content_type().to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            ))
        }
        ArtifactLookup::NotReady(status) => Err(AppError::NotReady { job_id, status }),
        ArtifactLookup::Failed(error) => Err(AppError::JobFailed {
            job_id,
            stage: error.stage,
            message: error.message,
        }),
    }
}

/// GET /jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<JobListResponse>> {
    let offset = params.offset.unwrap_or(0);
    let records = state
        .service
        .list(params.status, params.limit, Some(offset))
        .await?;
    let limit = params
        .limit
        .unwrap_or(crate::service::DEFAULT_LIST_LIMIT)
        .clamp(1, crate::service::MAX_LIST_LIMIT);
    Ok(Json(JobListResponse {
        jobs: records.into_iter().map(Into::into).collect(),
        limit,
        offset,
    }))
}

/// GET /jobs/{id}/bundle
pub async fn download_bundle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    let bytes = state.service.bundle(job_id).await?;
    let disposition = format!("attachment; filename=\"scan_{job_id}.zip\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> AppResult<Json<JobStats>> {
    Ok(Json(state.service.stats().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_core::PROGRESS_TOTAL;

    fn record() -> JobRecord {
        JobRecord::new(12, Dimensions::new(50.0, 40.0, 100.0).unwrap()).unwrap()
    }

    #[test]
    fn queued_job_has_no_stage_or_error() {
        let view = JobStatusResponse::from(record());
        assert_eq!(view.status, "queued");
        assert_eq!(view.stage, None);
        assert_eq!(view.progress.current, 0);
        assert_eq!(view.progress.total, PROGRESS_TOTAL);
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failed_job_reports_the_failing_stage() {
        let failed = record()
            .start("ingest-validate")
            .unwrap()
            .advance("feature-matching", 400)
            .unwrap()
            .fail(
                StageError::new("feature-matching", "tool exited with 1")
                    .with_exit_code(Some(1)),
            )
            .unwrap();
        let view = JobStatusResponse::from(failed);
        assert_eq!(view.status, "failed");
        assert_eq!(view.stage.as_deref(), Some("feature-matching"));
        assert_eq!(view.progress.percent, 40.0);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["error"]["stage"], "feature-matching");
        assert_eq!(json["error"]["exit_code"], 1);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(parse_job_id("not-a-uuid").is_err());
        assert!(parse_job_id(&JobId::new().to_string()).is_ok());
    }
}
