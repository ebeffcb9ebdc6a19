//! Runs a leased job through the pipeline.
//!
//! The executor is the only writer of a job record while it holds the lease.
//! Every mutation goes through [`JobRepository`], which loads the current
//! snapshot, applies one state machine transition and replaces the record.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use db::DbError;
use db::repositories::JobRepository;
use scan_core::{
    ArtifactFormat, Delivery, INPUT_PLACEHOLDER, JobEvent, JobId, JobRecord, JobStatus,
    MODEL_PLACEHOLDER, Pipeline, PostStep, ProgressPattern, ProgressPlan, RecoveryPolicy,
    StageAction, StageDescriptor, StageError, ToolCommand, WORK_PLACEHOLDER, mesh, substitute,
};
use sandbox::{
    INPUT_MOUNT, Invocation, Mount, ProcessRunner, RunnerError, ToolProgress, WORK_MOUNT,
};
use storage::{JobWorkspace, Storage, StorageError, Workspaces};
use tokio::sync::{broadcast, mpsc};

use crate::PipelineError;

/// Text model file the export stage leaves behind when its outputs do not
/// name one.
const DEFAULT_POINTS_FILE: &str = "output/model/points3D.txt";

/// How a delivery ended. Every outcome is acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    /// The record was already terminal or no longer exists.
    Skipped,
}

/// Why one stage attempt did not succeed.
enum AttemptError {
    /// Worth another attempt while retries remain.
    Retryable(StageError),
    /// Fails the job immediately.
    Fatal(StageError),
    /// Not the job's fault; the delivery is released.
    Infra(PipelineError),
}

impl From<PipelineError> for AttemptError {
    fn from(err: PipelineError) -> Self {
        AttemptError::Infra(err)
    }
}

impl From<DbError> for AttemptError {
    fn from(err: DbError) -> Self {
        AttemptError::Infra(err.into())
    }
}

impl From<StorageError> for AttemptError {
    fn from(err: StorageError) -> Self {
        AttemptError::Infra(err.into())
    }
}

/// Shared by every worker of a pool.
pub struct PipelineExecutor {
    pipeline: Arc<Pipeline>,
    plan: ProgressPlan,
    runner: Arc<dyn ProcessRunner>,
    workspaces: Workspaces,
    storage: Storage,
    events: broadcast::Sender<JobEvent>,
    max_deliveries: u32,
}

impl PipelineExecutor {
    pub fn new(
        pipeline: Pipeline,
        runner: Arc<dyn ProcessRunner>,
        workspaces: Workspaces,
        storage: Storage,
        events: broadcast::Sender<JobEvent>,
        max_deliveries: u32,
    ) -> Self {
        let plan = pipeline.progress_plan();
        Self {
            pipeline: Arc::new(pipeline),
            plan,
            runner,
            workspaces,
            storage,
            events,
            max_deliveries,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn runner(&self) -> &Arc<dyn ProcessRunner> {
        &self.runner
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Execute one delivery until the job is terminal.
    pub async fn execute(
        &self,
        worker_id: &str,
        delivery: &Delivery,
    ) -> Result<Outcome, PipelineError> {
        let job_id = delivery.job_id;
        let record = match JobRepository::get(job_id).await {
            Ok(record) => record,
            Err(DbError::NotFound(_)) => {
                tracing::warn!(%job_id, "delivery for unknown job, dropping");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        if record.status.is_terminal() {
            tracing::info!(%job_id, status = record.status.as_str(), "job already finished");
            return Ok(Outcome::Skipped);
        }

        if delivery.delivery_count > self.max_deliveries {
            return self.give_up(record, delivery.delivery_count).await;
        }

        let ws = self.workspaces.job(job_id);
        let start = match &record.status {
            JobStatus::Running { stage, .. } => self.recover(worker_id, &ws, stage).await?,
            _ => {
                JobRepository::transition_to_running(job_id, &self.pipeline.first().name)
                    .await?;
                tracing::info!(%job_id, worker_id, "job started");
                self.emit(JobEvent::JobStarted {
                    job_id,
                    worker_id: worker_id.to_string(),
                    timestamp: Utc::now(),
                });
                0
            }
        };

        for (index, stage) in self.pipeline.stages().iter().enumerate().skip(start) {
            if let Err(error) = self.run_stage(&ws, &record, index, stage).await? {
                return self.fail(&ws, job_id, error).await;
            }
        }

        self.publish(&ws, job_id).await
    }

    /// Decide where a crashed job picks up. Returns the stage index to start
    /// from.
    async fn recover(
        &self,
        worker_id: &str,
        ws: &JobWorkspace,
        stage_name: &str,
    ) -> Result<usize, PipelineError> {
        let job_id = ws.id();
        let resumable = match self.pipeline.position(stage_name) {
            Some(index) => {
                let stage = &self.pipeline.stages()[index];
                if stage.recovery == RecoveryPolicy::Resume
                    && self.missing_input(ws, stage).await?.is_none()
                {
                    Some(index)
                } else {
                    None
                }
            }
            None => {
                tracing::warn!(%job_id, stage_name, "interrupted stage is not in the pipeline");
                None
            }
        };

        JobRepository::mark_recovered(job_id).await?;
        let start = match resumable {
            Some(index) => index,
            None => {
                ws.reset_scratch().await?;
                0
            }
        };

        tracing::warn!(
            %job_id,
            worker_id,
            stage = stage_name,
            restarted = resumable.is_none(),
            "recovering interrupted job"
        );
        self.emit(JobEvent::JobRecovered {
            job_id,
            worker_id: worker_id.to_string(),
            stage: stage_name.to_string(),
            restarted: resumable.is_none(),
            timestamp: Utc::now(),
        });
        Ok(start)
    }

    async fn give_up(&self, record: JobRecord, deliveries: u32) -> Result<Outcome, PipelineError> {
        let job_id = record.id;
        let stage = record
            .current_stage()
            .unwrap_or(&self.pipeline.first().name)
            .to_string();
        if matches!(record.status, JobStatus::Queued) {
            JobRepository::transition_to_running(job_id, &stage).await?;
        }
        let error = StageError::new(
            stage,
            format!(
                "job was delivered {deliveries} times without finishing (limit {})",
                self.max_deliveries
            ),
        );
        self.fail(&self.workspaces.job(job_id), job_id, error).await
    }

    /// Run one stage with its retries. The outer error is infrastructure;
    /// the inner one fails the job.
    async fn run_stage(
        &self,
        ws: &JobWorkspace,
        record: &JobRecord,
        index: usize,
        stage: &StageDescriptor,
    ) -> Result<Result<(), StageError>, PipelineError> {
        let job_id = ws.id();
        JobRepository::advance_stage(job_id, &stage.name, self.plan.stage_start(index)).await?;

        let attempts = stage.max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            tracing::info!(%job_id, stage = %stage.name, attempt, "stage started");
            self.emit(JobEvent::StageStarted {
                job_id,
                stage: stage.name.clone(),
                attempt,
                timestamp: Utc::now(),
            });

            match self.attempt(ws, record, index, stage).await {
                Ok(()) => {
                    JobRepository::advance_stage(job_id, &stage.name, self.plan.stage_end(index))
                        .await?;
                    return Ok(Ok(()));
                }
                Err(AttemptError::Infra(e)) => return Err(e),
                Err(AttemptError::Fatal(error)) => return Ok(Err(error)),
                Err(AttemptError::Retryable(error)) if attempt < attempts => {
                    tracing::warn!(
                        %job_id,
                        stage = %stage.name,
                        attempt,
                        "stage attempt failed, retrying: {}",
                        error.message
                    );
                    self.emit(JobEvent::StageRetrying {
                        job_id,
                        stage: stage.name.clone(),
                        attempt,
                        error: error.message.clone(),
                        timestamp: Utc::now(),
                    });
                    if stage.recovery == RecoveryPolicy::Restart {
                        self.clear_outputs(ws, stage).await?;
                    }
                }
                Err(AttemptError::Retryable(error)) => return Ok(Err(error)),
            }
        }

        Ok(Err(StageError::new(&stage.name, "stage has no attempts left")))
    }

    async fn attempt(
        &self,
        ws: &JobWorkspace,
        record: &JobRecord,
        index: usize,
        stage: &StageDescriptor,
    ) -> Result<(), AttemptError> {
        for dir in &stage.scratch_dirs {
            ws.create_scratch_dir(dir).await?;
        }
        if let Some(missing) = self.missing_input(ws, stage).await? {
            return Err(AttemptError::Fatal(StageError::new(
                &stage.name,
                format!("required input {missing} is missing"),
            )));
        }

        match &stage.action {
            StageAction::IngestBundle => self.ingest(ws, record, stage).await?,
            StageAction::Tool(command) => {
                self.invoke(ws, record, index, stage, command).await?
            }
        }

        let model = ws.find_model_dir().await?;
        for output in &stage.outputs {
            let path = match resolve(output, model.as_deref()) {
                Some(path) => path,
                None => {
                    return Err(AttemptError::Retryable(StageError::new(
                        &stage.name,
                        "stage produced no reconstructed model",
                    )));
                }
            };
            if !ws.scratch_exists(&path).await? {
                return Err(AttemptError::Retryable(StageError::new(
                    &stage.name,
                    format!("stage did not produce {path}"),
                )));
            }
        }

        if let Some(PostStep::BuildModels) = stage.post {
            self.build_models(ws, record, stage).await?;
        }
        Ok(())
    }

    async fn ingest(
        &self,
        ws: &JobWorkspace,
        record: &JobRecord,
        stage: &StageDescriptor,
    ) -> Result<(), AttemptError> {
        match ws.extract_images().await {
            Ok(count) => {
                if count != record.input_photo_count as usize {
                    tracing::warn!(
                        job_id = %ws.id(),
                        declared = record.input_photo_count,
                        found = count,
                        "bundle image count differs from photoCount"
                    );
                }
                Ok(())
            }
            Err(StorageError::InvalidBundle(msg)) => {
                Err(AttemptError::Fatal(StageError::new(&stage.name, msg)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn invoke(
        &self,
        ws: &JobWorkspace,
        record: &JobRecord,
        index: usize,
        stage: &StageDescriptor,
        command: &ToolCommand,
    ) -> Result<(), AttemptError> {
        let job_id = ws.id();
        let model = if stage.needs_model() {
            match ws.find_model_dir().await? {
                Some(model) => model,
                None if command.uses_placeholder(MODEL_PLACEHOLDER) => {
                    return Err(AttemptError::Fatal(StageError::new(
                        &stage.name,
                        "no reconstructed model to work on",
                    )));
                }
                None => String::new(),
            }
        } else {
            String::new()
        };

        let command = command.render(&[
            (INPUT_PLACEHOLDER, INPUT_MOUNT),
            (WORK_PLACEHOLDER, WORK_MOUNT),
            (MODEL_PLACEHOLDER, &model),
        ]);
        let expected = match stage.progress {
            ProgressPattern::RegisteredImages => Some(u64::from(record.input_photo_count)),
            _ => None,
        };
        let invocation = Invocation::new(job_id, &stage.name, command)
            .with_mount(Mount::read_only(ws.input_dir(), INPUT_MOUNT))
            .with_mount(Mount::read_write(ws.scratch_dir(), WORK_MOUNT))
            .with_timeout(Duration::from_secs(stage.timeout_secs))
            .with_progress(stage.progress, expected);

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ToolProgress>();
        let forwarder = {
            let plan = self.plan.clone();
            let events = self.events.clone();
            let stage_name = stage.name.clone();
            tokio::spawn(async move {
                let mut last = plan.stage_start(index);
                while let Some(report) = progress_rx.recv().await {
                    let _ = events.send(JobEvent::StageProgress {
                        job_id,
                        stage: stage_name.clone(),
                        current: report.current,
                        total: report.total,
                        timestamp: Utc::now(),
                    });
                    let mapped = plan.map(index, report.current, report.total);
                    if mapped <= last {
                        continue;
                    }
                    last = mapped;
                    if let Err(e) = JobRepository::advance_stage(job_id, &stage_name, mapped).await
                    {
                        tracing::warn!(%job_id, "failed to record stage progress: {}", e);
                    }
                }
            })
        };

        let result = self.runner.run(invocation, progress_tx).await;
        if let Err(e) = forwarder.await {
            tracing::warn!(%job_id, "progress forwarder ended abnormally: {}", e);
        }

        match result {
            Ok(output) => {
                tracing::debug!(
                    %job_id,
                    stage = %stage.name,
                    duration_ms = output.duration_ms,
                    lines = output.lines,
                    "tool finished"
                );
                Ok(())
            }
            Err(RunnerError::Shutdown) => Err(AttemptError::Infra(PipelineError::Interrupted(
                stage.name.clone(),
            ))),
            Err(e @ RunnerError::InvalidInvocation(_)) => Err(AttemptError::Fatal(
                StageError::new(&stage.name, e.to_string()),
            )),
            Err(e) => Err(AttemptError::Retryable(
                StageError::new(&stage.name, e.to_string())
                    .with_exit_code(e.exit_code())
                    .with_output_tail(e.tail()),
            )),
        }
    }

    /// Derive the point cloud and mesh from the exported text model.
    async fn build_models(
        &self,
        ws: &JobWorkspace,
        record: &JobRecord,
        stage: &StageDescriptor,
    ) -> Result<(), AttemptError> {
        let points_file = stage
            .outputs
            .iter()
            .find(|o| o.ends_with("points3D.txt"))
            .map(String::as_str)
            .unwrap_or(DEFAULT_POINTS_FILE);
        let path = ws.scratch_path(points_file)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AttemptError::Retryable(StageError::new(
                    &stage.name,
                    format!("exported model has no {points_file}"),
                )));
            }
            Err(e) => return Err(AttemptError::Infra(StorageError::from(e).into())),
        };

        let points = mesh::parse_points3d(&text)
            .map_err(|e| AttemptError::Fatal(StageError::new(&stage.name, e.to_string())))?;
        if points.len() < 4 {
            tracing::warn!(
                job_id = %ws.id(),
                points = points.len(),
                "sparse cloud too small, meshing the submitted dimensions"
            );
        }

        ws.write_output(ArtifactFormat::Ply.file_name(), mesh::to_ply(&points).as_bytes())
            .await?;
        ws.write_output(
            ArtifactFormat::Obj.file_name(),
            mesh::build_mesh(&points, &record.dimensions).as_bytes(),
        )
        .await?;
        Ok(())
    }

    /// Remove what a restart-policy stage left behind, keeping its inputs.
    async fn clear_outputs(
        &self,
        ws: &JobWorkspace,
        stage: &StageDescriptor,
    ) -> Result<(), PipelineError> {
        let model = ws.find_model_dir().await?;
        let inputs: Vec<String> = stage
            .inputs
            .iter()
            .filter_map(|i| resolve(i, model.as_deref()))
            .collect();
        let leftovers = stage
            .outputs
            .iter()
            .filter_map(|o| resolve(o, model.as_deref()))
            .chain(stage.scratch_dirs.iter().cloned())
            .filter(|path| !inputs.iter().any(|i| i == path || i.starts_with(&format!("{path}/"))));
        for path in leftovers {
            ws.remove_scratch(&path).await?;
        }
        Ok(())
    }

    /// First declared input of `stage` absent from scratch.
    async fn missing_input(
        &self,
        ws: &JobWorkspace,
        stage: &StageDescriptor,
    ) -> Result<Option<String>, PipelineError> {
        let model = ws.find_model_dir().await?;
        for input in &stage.inputs {
            match resolve(input, model.as_deref()) {
                Some(path) if ws.scratch_exists(&path).await? => {}
                Some(path) => return Ok(Some(path)),
                None => return Ok(Some(input.clone())),
            }
        }
        Ok(None)
    }

    async fn publish(&self, ws: &JobWorkspace, job_id: JobId) -> Result<Outcome, PipelineError> {
        let mut artifacts: Vec<(ArtifactFormat, Bytes)> = Vec::new();
        for format in ArtifactFormat::ALL {
            match ws.read_output(format.file_name()).await {
                Ok(bytes) => artifacts.push((format, bytes)),
                Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let last = self
            .pipeline
            .stages()
            .last()
            .map_or_else(String::new, |s| s.name.clone());
        if artifacts.is_empty() {
            return self
                .fail(ws, job_id, StageError::new(last, "pipeline produced no artifacts"))
                .await;
        }

        let path = self.storage.publish_artifacts(job_id, artifacts).await?;
        let record = JobRepository::complete(job_id, &path).await?;
        self.cleanup(ws).await;

        let duration_ms = record
            .started_at()
            .zip(record.finished_at())
            .map_or(0, |(start, end)| (end - start).num_milliseconds().max(0) as u64);
        tracing::info!(%job_id, artifact_path = %path, duration_ms, "job completed");
        self.emit(JobEvent::JobCompleted {
            job_id,
            artifact_path: path,
            duration_ms,
            timestamp: Utc::now(),
        });
        Ok(Outcome::Completed)
    }

    async fn fail(
        &self,
        ws: &JobWorkspace,
        job_id: JobId,
        error: StageError,
    ) -> Result<Outcome, PipelineError> {
        tracing::error!(%job_id, stage = %error.stage, "job failed: {}", error.message);
        let event = JobEvent::JobFailed {
            job_id,
            stage: error.stage.clone(),
            error: error.message.clone(),
            timestamp: Utc::now(),
        };
        JobRepository::fail(job_id, error).await?;
        self.cleanup(ws).await;
        self.emit(event);
        Ok(Outcome::Failed)
    }

    async fn cleanup(&self, ws: &JobWorkspace) {
        if let Err(e) = self.workspaces.finish(ws).await {
            tracing::warn!(job_id = %ws.id(), "failed to clean scratch: {}", e);
        }
    }
}

/// Resolve a scratch-relative template. `None` when it needs a model that
/// does not exist yet.
fn resolve(template: &str, model: Option<&str>) -> Option<String> {
    if template.contains(MODEL_PLACEHOLDER) {
        model.map(|m| substitute(template, &[(MODEL_PLACEHOLDER, m)]))
    } else {
        Some(template.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_model_templates() {
        assert_eq!(resolve("database.db", None).as_deref(), Some("database.db"));
        assert_eq!(resolve("{model}", None), None);
        assert_eq!(
            resolve("{model}/points3D.bin", Some("sparse/0")).as_deref(),
            Some("sparse/0/points3D.bin")
        );
    }
}
