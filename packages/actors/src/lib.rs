//! Actor system for the scan orchestrator.
//!
//! This crate provides the Ractor-based worker pool that turns queued jobs
//! into published artifacts.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor; restarts the broker and workers
//! - `BrokerActor` - Owns deliveries and leases them to one worker at a time
//! - `WorkerActor` - Polls the broker and runs jobs through the pipeline
//! - `PipelineExecutor` - Stage loop, retries, crash recovery and publishing
//!
//! # Usage
//!
//! ```ignore
//! use actors::{PipelineExecutor, PoolConfig, WorkerPool};
//!
//! let (events, _) = tokio::sync::broadcast::channel(1024);
//! let executor = PipelineExecutor::new(pipeline, runner, workspaces, storage, events.clone(), 5);
//! let (pool, handle) = WorkerPool::start(PoolConfig::from_env()?, Arc::new(executor), events).await?;
//! pool.submit(job_id).await?;
//! ```

mod broker_actor;
mod config;
mod error;
mod executor;
mod messages;
mod supervisor;
mod worker_actor;

pub use broker_actor::{BrokerActor, BrokerArgs};
pub use config::{PoolConfig, load_pipeline, pipeline_from_env};
pub use error::PipelineError;
pub use executor::{Outcome, PipelineExecutor};
pub use messages::{BrokerMessage, PoolHealth, SupervisorMessage, WorkerMessage};
pub use supervisor::{Supervisor, SupervisorArgs, WorkerPool};
pub use worker_actor::{WorkerActor, WorkerArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
