#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use actors::{PipelineExecutor, PoolConfig};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use db::DbConfig;
use http_body_util::BodyExt;
use sandbox::LocalRunner;
use scan_api::config::ServerConfig;
use scan_api::{AppState, ScanService, ServiceParts, build_app};
use scan_core::{
    Pipeline, PostStep, RecoveryPolicy, StageAction, StageDescriptor, ToolCommand,
};
use serde_json::Value;
use storage::{Storage, StorageConfig, WorkspaceConfig, Workspaces};
use tempfile::TempDir;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio::task::JoinHandle;
use tower::ServiceExt;

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

pub const BOUNDARY: &str = "scan-test-boundary";

pub const METADATA: &str =
    r#"{"photoCount": 3, "dimensions": {"length": 50, "width": 40, "height": 100}}"#;

const POINTS: &str = "1 0 0 0 255 0 0 0.1\\n2 1 0 0 0 255 0 0.1\\n\
                      3 0 1 0 0 0 255 0.1\\n4 0 0 1 9 9 9 0.1";

/// A running application: router, service and worker pool.
pub struct TestApp {
    _guard: MutexGuard<'static, ()>,
    pub dir: TempDir,
    pub app: Router,
    pub service: Arc<ScanService>,
    handle: Option<JoinHandle<()>>,
}

impl TestApp {
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn submit(&self, parts: &[Part<'_>]) -> Response<Body> {
        let request = Request::post("/jobs")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();
        self.request(request).await
    }

    /// Submit a valid three-image job and return its id.
    pub async fn submit_ok(&self) -> String {
        let bundle = bundle(3, None);
        let response = self
            .submit(&[Part::File("bundle", &bundle), Part::Text("metadata", METADATA)])
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "queued");
        json["job_id"].as_str().unwrap().to_string()
    }

    /// Poll the status route until the job is completed or failed.
    pub async fn wait_terminal(&self, job_id: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let json = body_json(self.get(&format!("/jobs/{job_id}")).await).await;
            let status = json["status"].as_str().unwrap_or_default().to_string();
            if status == "completed" || status == "failed" {
                return json;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} stuck in {status}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Stop the worker pool and wait for it, keeping the router.
    pub async fn stop_pool(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.service.pool().shutdown();
            handle.await.unwrap();
        }
    }

    pub async fn shutdown(mut self) {
        self.stop_pool().await;
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.service.pool().shutdown();
        }
    }
}

pub async fn setup() -> TestApp {
    setup_with(pipeline()).await
}

pub async fn setup_with(pipeline: Pipeline) -> TestApp {
    let guard = TEST_LOCK.lock().await;
    DB_RUNTIME
        .spawn(db::init(DbConfig::memory()))
        .await
        .unwrap()
        .unwrap();
    db::get_db()
        .unwrap()
        .query("DELETE scan_job; DELETE delivery;")
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let workspaces = Workspaces::new(WorkspaceConfig::new(dir.path().join("workspace")))
        .await
        .unwrap();
    let storage = Storage::new(StorageConfig::memory()).await.unwrap();
    let (events, _) = broadcast::channel(1024);
    let executor = Arc::new(PipelineExecutor::new(
        pipeline,
        Arc::new(LocalRunner::new(20)),
        workspaces.clone(),
        storage.clone(),
        events.clone(),
        3,
    ));

    let parts = ServiceParts {
        workspaces,
        storage,
        executor,
        pool_config: PoolConfig {
            worker_count: 2,
            lease: Duration::from_secs(10),
            max_deliveries: 3,
            poll_interval: Duration::from_millis(20),
        },
        events,
    };
    let (service, handle) = parts.start().await.unwrap();
    let service = Arc::new(service);

    let state = AppState {
        service: Arc::clone(&service),
        config: Arc::new(ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        }),
    };

    TestApp {
        _guard: guard,
        dir,
        app: build_app(state),
        service,
        handle: Some(handle),
    }
}

fn shell(name: &str, script: &str) -> StageDescriptor {
    StageDescriptor::new(
        name,
        StageAction::Tool(ToolCommand::new("sh", &["-c", script])),
    )
    .with_timeout(20)
}

fn ingest() -> StageDescriptor {
    StageDescriptor::new("ingest", StageAction::IngestBundle)
        .with_outputs(&["images"])
        .with_recovery(RecoveryPolicy::Resume)
}

/// Ingest, then an export that writes a four-point text model.
pub fn pipeline() -> Pipeline {
    let export = shell(
        "export",
        &format!("printf '{POINTS}\\n' > {{work}}/output/model/points3D.txt"),
    )
    .with_inputs(&["images"])
    .with_outputs(&["output/model/points3D.txt"])
    .with_scratch_dirs(&["output/model"])
    .with_recovery(RecoveryPolicy::Resume)
    .with_post(PostStep::BuildModels);
    Pipeline::new(vec![ingest(), export]).unwrap()
}

/// Same shape, with an export that exits 3.
pub fn failing_pipeline() -> Pipeline {
    let export = shell("export", "echo 'no model written' && exit 3").with_inputs(&["images"]);
    Pipeline::new(vec![ingest(), export]).unwrap()
}

pub enum Part<'a> {
    File(&'a str, &'a [u8]),
    Text(&'a str, &'a str),
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::File(name, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"scan.zip\"\r\n\
                         Content-Type: application/zip\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
            Part::Text(name, text) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(text.as_bytes());
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Zip with `images` JPEG entries, optionally carrying `metadata.json`.
pub fn bundle(images: usize, metadata: Option<&str>) -> Bytes {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for i in 0..images {
        writer
            .start_file(format!("photos/photo_{i:02}.JPG"), options)
            .unwrap();
        writer.write_all(b"\xff\xd8\xff\xe0fake").unwrap();
    }
    if let Some(metadata) = metadata {
        writer.start_file("metadata.json", options).unwrap();
        writer.write_all(metadata.as_bytes()).unwrap();
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
