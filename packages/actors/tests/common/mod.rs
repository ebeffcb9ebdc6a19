#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use actors::{PipelineExecutor, PoolConfig};
use bytes::Bytes;
use db::repositories::JobRepository;
use db::{DbConfig, DbError};
use sandbox::{
    Invocation, LocalRunner, ProcessRunner, ProgressSink, RunFuture, RunOutput, RunnerError,
};
use scan_core::{
    Dimensions, JobEvent, JobId, JobRecord, Pipeline, PostStep, ProgressPattern, RecoveryPolicy,
    StageAction, StageDescriptor, ToolCommand,
};
use storage::{Storage, StorageConfig, WorkspaceConfig, Workspaces};
use tempfile::TempDir;
use tokio::sync::{Mutex, MutexGuard, broadcast};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Runtime that owns the global `mem://` connection. The engine's router task
/// is spawned where the connection is opened, so it must outlive every
/// per-test `#[tokio::test]` runtime.
static DB_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("db test runtime")
});

/// Text model rows written by the fake export stage.
pub const POINTS: [&str; 4] = [
    "1 0 0 0 255 0 0 0.1",
    "2 1 0 0 0 255 0 0.1",
    "3 0 1 0 0 0 255 0.1",
    "4 0 0 1 9 9 9 0.1",
];

pub struct Harness {
    _guard: MutexGuard<'static, ()>,
    pub dir: TempDir,
    pub workspaces: Workspaces,
    pub storage: Storage,
    pub events: broadcast::Sender<JobEvent>,
}

impl Harness {
    pub fn executor(&self, pipeline: Pipeline, max_deliveries: u32) -> Arc<PipelineExecutor> {
        self.executor_with(pipeline, Arc::new(LocalRunner::new(20)), max_deliveries)
    }

    pub fn executor_with(
        &self,
        pipeline: Pipeline,
        runner: Arc<dyn ProcessRunner>,
        max_deliveries: u32,
    ) -> Arc<PipelineExecutor> {
        Arc::new(PipelineExecutor::new(
            pipeline,
            runner,
            self.workspaces.clone(),
            self.storage.clone(),
            self.events.clone(),
            max_deliveries,
        ))
    }

    /// Create a queued record and store its bundle, as the API does.
    pub async fn create_job(&self, images: usize) -> Result<JobId, DbError> {
        let dims = Dimensions::new(50.0, 40.0, 100.0)?;
        let job_id = JobRepository::create(images.max(1) as u32, dims).await?;
        self.workspaces
            .ingest(job_id, bundle(images))
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(job_id)
    }
}

/// Local runner whose first invocation of `stage` panics partway through,
/// taking the worker running it down.
pub struct CrashOnce {
    inner: LocalRunner,
    stage: &'static str,
    crashed: AtomicBool,
}

impl CrashOnce {
    pub fn new(stage: &'static str) -> Self {
        Self {
            inner: LocalRunner::new(20),
            stage,
            crashed: AtomicBool::new(false),
        }
    }
}

async fn crash() -> Result<RunOutput, RunnerError> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    panic!("tool runner crashed");
}

impl ProcessRunner for CrashOnce {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn run(&self, invocation: Invocation, progress: ProgressSink) -> RunFuture<'_, RunOutput> {
        if invocation.stage == self.stage && !self.crashed.swap(true, Ordering::SeqCst) {
            return Box::pin(crash());
        }
        self.inner.run(invocation, progress)
    }

    fn shutdown(&self) -> RunFuture<'_, ()> {
        self.inner.shutdown()
    }

    fn reap_orphans(&self) -> RunFuture<'_, usize> {
        self.inner.reap_orphans()
    }
}

pub async fn setup() -> Result<Harness, DbError> {
    let guard = TEST_LOCK.lock().await;
    DB_RUNTIME
        .spawn(db::init(DbConfig::memory()))
        .await
        .expect("db init task")?;
    db::get_db()?
        .query("DELETE scan_job; DELETE delivery;")
        .await?;

    let dir = tempfile::tempdir().map_err(|e| DbError::Query(e.to_string()))?;
    let workspaces = Workspaces::new(WorkspaceConfig::new(dir.path().join("workspace")))
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
    let storage = Storage::new(StorageConfig::memory())
        .await
        .map_err(|e| DbError::Query(e.to_string()))?;
    let (events, _) = broadcast::channel(1024);

    Ok(Harness {
        _guard: guard,
        dir,
        workspaces,
        storage,
        events,
    })
}

pub fn pool_config(workers: usize) -> PoolConfig {
    PoolConfig {
        worker_count: workers,
        lease: Duration::from_secs(10),
        max_deliveries: 3,
        poll_interval: Duration::from_millis(20),
    }
}

/// Zip with `images` small JPEG entries and a text file that must be skipped.
pub fn bundle(images: usize) -> Bytes {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for i in 0..images {
        writer
            .start_file(format!("capture/img_{i:03}.jpg"), options)
            .unwrap();
        writer.write_all(b"\xff\xd8\xff\xe0fake").unwrap();
    }
    writer.start_file("capture/notes.txt", options).unwrap();
    writer.write_all(b"turntable").unwrap();
    Bytes::from(writer.finish().unwrap().into_inner())
}

pub fn shell(name: &str, script: &str) -> StageDescriptor {
    StageDescriptor::new(
        name,
        StageAction::Tool(ToolCommand::new("sh", &["-c", script])),
    )
    .with_timeout(20)
}

/// Four-stage pipeline shaped like the COLMAP one, backed by shell scripts.
pub fn stages() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor::new("ingest", StageAction::IngestBundle)
            .with_outputs(&["images"])
            .with_recovery(RecoveryPolicy::Resume),
        shell(
            "extract",
            "ls {work}/images > {work}/features.txt \
             && echo 'Processed file [1/2]' && echo 'Processed file [2/2]'",
        )
        .with_inputs(&["images"])
        .with_outputs(&["features.txt"])
        .with_progress(ProgressPattern::Fraction),
        shell(
            "reconstruct",
            "mkdir -p {work}/sparse/0 && cp {work}/features.txt {work}/sparse/0/cameras.txt",
        )
        .with_inputs(&["features.txt"])
        .with_outputs(&["{model}"])
        .with_scratch_dirs(&["sparse"]),
        shell(
            "export",
            &format!(
                "cat {{work}}/{{model}}/cameras.txt > /dev/null \
                 && printf '{}\\n' > {{work}}/output/model/points3D.txt",
                POINTS.join("\\n")
            ),
        )
        .with_inputs(&["{model}"])
        .with_outputs(&["output/model/points3D.txt"])
        .with_scratch_dirs(&["output/model"])
        .with_recovery(RecoveryPolicy::Resume)
        .with_post(PostStep::BuildModels),
    ]
}

pub fn pipeline() -> Pipeline {
    Pipeline::new(stages()).unwrap()
}

/// Same pipeline with one stage swapped out.
pub fn pipeline_with(replacement: StageDescriptor) -> Pipeline {
    let stages = stages()
        .into_iter()
        .map(|s| {
            if s.name == replacement.name {
                replacement.clone()
            } else {
                s
            }
        })
        .collect();
    Pipeline::new(stages).unwrap()
}

pub async fn wait_terminal(job_id: JobId) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let record = JobRepository::get(job_id).await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} stuck in {:?}",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Collect the events of `job_id` up to and including its terminal event.
pub async fn events_until_done(
    rx: &mut broadcast::Receiver<JobEvent>,
    job_id: JobId,
) -> Vec<JobEvent> {
    let mut out = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("no terminal event in time")
            .expect("event channel closed");
        if event.job_id() != Some(job_id) {
            continue;
        }
        let done = matches!(
            event,
            JobEvent::JobCompleted { .. } | JobEvent::JobFailed { .. }
        );
        out.push(event);
        if done {
            return out;
        }
    }
}

pub fn started_stages(events: &[JobEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::StageStarted { stage, .. } => Some(stage.clone()),
            _ => None,
        })
        .collect()
}
