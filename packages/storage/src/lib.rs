//! Artifact storage for the scan orchestrator.
//!
//! Two layers:
//! - [`Workspaces`]: per-job directories on local disk holding the input
//!   bundle, the scratch area mounted into the sandbox, and derived outputs
//! - [`Storage`]: object storage (S3, filesystem or memory) holding the
//!   published artifacts served to clients

mod error;
mod object;
mod workspace;

pub use error::StorageError;
pub use object::{
    ArtifactManifest, S3Config, Storage, StorageBackendConfig, StorageConfig, StorageKind,
};
pub use workspace::{
    BUNDLE_FILE, BundleSummary, IMAGES_DIR, JobWorkspace, METADATA_FILE, WorkspaceConfig,
    Workspaces, inspect_bundle,
};
