//! Core domain types for the scan orchestrator.
//!
//! This crate contains shared types used across all packages:
//! - JobRecord and its state machine
//! - Submission metadata parsing
//! - Stage pipeline definition and progress mapping
//! - Broker deliveries, artifacts, model derivation and events

mod artifact;
mod error;
mod events;
mod job;
mod metadata;
pub mod mesh;
mod pipeline;
mod queue;

pub use artifact::{ArtifactFormat, artifact_prefix};
pub use error::CoreError;
pub use events::JobEvent;
pub use job::{Dimensions, JobId, JobRecord, JobStatus, PROGRESS_TOTAL, Progress, StageError};
pub use metadata::{DimensionOverrides, ScanRequest};
pub use pipeline::{
    INPUT_PLACEHOLDER, MODEL_PLACEHOLDER, Pipeline, PostStep, ProgressPattern, ProgressPlan,
    RecoveryPolicy, StageAction, StageDescriptor, ToolCommand, WORK_PLACEHOLDER, substitute,
};
pub use queue::{BrokerStats, Delivery};
