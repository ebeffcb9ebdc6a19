//! One tool run, described in container terms.

use std::path::PathBuf;
use std::time::Duration;

use scan_core::{JobId, ProgressPattern, ToolCommand};

/// Container path of the read-only input mount.
pub const INPUT_MOUNT: &str = "/input";
/// Container path of the read-write scratch mount.
pub const WORK_MOUNT: &str = "/work";

/// A host directory made visible inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }
}

/// Everything a runner needs for one stage attempt. Arguments reference
/// container paths only; host paths appear solely in `mounts`.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub job_id: JobId,
    pub stage: String,
    pub program: String,
    pub args: Vec<String>,
    pub mounts: Vec<Mount>,
    /// Container working directory.
    pub workdir: String,
    pub timeout: Duration,
    pub progress: ProgressPattern,
    /// Denominator for patterns that do not print one themselves.
    pub expected_total: Option<u64>,
}

impl Invocation {
    pub fn new(job_id: JobId, stage: impl Into<String>, command: ToolCommand) -> Self {
        Self {
            job_id,
            stage: stage.into(),
            program: command.program,
            args: command.args,
            mounts: Vec::new(),
            workdir: WORK_MOUNT.to_string(),
            timeout: Duration::from_secs(3600),
            progress: ProgressPattern::None,
            expected_total: None,
        }
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress(mut self, pattern: ProgressPattern, expected_total: Option<u64>) -> Self {
        self.progress = pattern;
        self.expected_total = expected_total;
        self
    }

    /// Host directory backing a container path, if it is mounted.
    pub fn host_path_for(&self, container: &str) -> Option<&PathBuf> {
        self.mounts
            .iter()
            .find(|m| m.container == container)
            .map(|m| &m.host)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::RunnerError> {
        if self.program.trim().is_empty() {
            return Err(crate::RunnerError::InvalidInvocation(format!(
                "stage {} has no program",
                self.stage
            )));
        }
        for mount in &self.mounts {
            if !mount.container.starts_with('/') {
                return Err(crate::RunnerError::InvalidInvocation(format!(
                    "mount target {} is not absolute",
                    mount.container
                )));
            }
            if !mount.host.is_absolute() {
                return Err(crate::RunnerError::InvalidInvocation(format!(
                    "mount source {} is not absolute",
                    mount.host.display()
                )));
            }
        }
        Ok(())
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
    /// Last lines of combined stdout and stderr.
    pub output_tail: String,
    pub lines: u64,
    pub duration_ms: u64,
}
