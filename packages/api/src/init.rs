//! Server initialization for the scan orchestrator.

use std::sync::Arc;

use actors::{PipelineError, PipelineExecutor, PoolConfig, WorkerPool, pipeline_from_env};
use db::{DbConfig, DbError};
use sandbox::{RunnerConfig, RunnerError};
use scan_core::JobEvent;
use storage::{Storage, StorageError, WorkspaceConfig, Workspaces};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::service::ScanService;

/// Capacity of the lifecycle event channel.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("database: {0}")]
    Db(#[from] DbError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("runner: {0}")]
    Runner(#[from] RunnerError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("worker pool failed to start: {0}")]
    Pool(String),
}

/// Everything [`ScanService`] is built from.
pub struct ServiceParts {
    pub workspaces: Workspaces,
    pub storage: Storage,
    pub executor: Arc<PipelineExecutor>,
    pub pool_config: PoolConfig,
    pub events: broadcast::Sender<JobEvent>,
}

impl ServiceParts {
    /// Read every component's configuration from the environment. The
    /// database must already be initialized.
    pub async fn from_env() -> Result<Self, InitError> {
        let storage = Storage::from_env().await?;
        let workspaces = Workspaces::new(WorkspaceConfig::from_env()?).await?;
        let runner = RunnerConfig::from_env()?.build();
        let pipeline = pipeline_from_env()?;
        let pool_config = PoolConfig::from_env()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(
            storage = storage.kind().as_str(),
            workspace = %workspaces.config().root.display(),
            runner = runner.backend(),
            stages = pipeline.stages().len(),
            workers = pool_config.worker_count,
            "Loaded orchestrator configuration"
        );

        let executor = Arc::new(PipelineExecutor::new(
            pipeline,
            runner,
            workspaces.clone(),
            storage.clone(),
            events.clone(),
            pool_config.max_deliveries,
        ));

        Ok(Self {
            workspaces,
            storage,
            executor,
            pool_config,
            events,
        })
    }

    /// Start the worker pool and wrap it in a service.
    pub async fn start(self) -> Result<(ScanService, JoinHandle<()>), InitError> {
        let (pool, handle) = WorkerPool::start(self.pool_config, self.executor, self.events.clone())
            .await
            .map_err(|e| InitError::Pool(e.to_string()))?;
        let service = ScanService::new(self.workspaces, self.storage, pool, self.events);
        Ok((service, handle))
    }
}

/// Initialize the database and start the orchestrator from environment
/// configuration.
///
/// This should be called once at server startup before handling requests.
pub async fn init_scan_service() -> Result<(ScanService, JoinHandle<()>), InitError> {
    tracing::info!("Initializing scan orchestrator...");

    db::init(DbConfig::from_env()).await?;
    let (service, handle) = ServiceParts::from_env().await?.start().await?;

    tracing::info!("Scan orchestrator initialized");
    Ok((service, handle))
}
