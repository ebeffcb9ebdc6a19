//! HTTP surface of the scan orchestrator.
//!
//! This crate contains:
//! - Job submission (multipart upload of a bundle and its metadata)
//! - Status, artifact, bundle, listing and statistics reads
//! - Real-time events (SSE streaming)
//! - Health reporting and server initialization

pub mod config;
pub mod error;
pub mod health;
pub mod init;
pub mod jobs;
pub mod realtime;
pub mod router;
pub mod service;
pub mod state;

pub use config::ServerConfig;
pub use error::{AppError, AppResult};
pub use init::{InitError, ServiceParts, init_scan_service};
pub use router::build_app;
pub use service::{ArtifactLookup, ScanService, Submission};
pub use state::AppState;

// Re-export core types for convenience
pub use scan_core::{ArtifactFormat, JobEvent, JobId, JobRecord, JobStatus};
