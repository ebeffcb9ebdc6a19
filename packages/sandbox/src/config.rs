use std::sync::Arc;

use crate::{ContainerRunner, LocalRunner, ProcessRunner, RunnerError};

/// Which runner executes tool invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Docker,
    Podman,
    Local,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Docker => "docker",
            Backend::Podman => "podman",
            Backend::Local => "local",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Backend::Docker),
            "podman" => Ok(Backend::Podman),
            "local" => Ok(Backend::Local),
            other => Err(RunnerError::InvalidInvocation(format!(
                "unsupported RUNNER_BACKEND={other} (expected docker|podman|local)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub backend: Backend,
    /// Image holding the reconstruction tool.
    pub image: String,
    pub cpus: Option<String>,
    pub memory: Option<String>,
    pub gpus: Option<String>,
    /// Label value identifying containers started by this process.
    pub instance: String,
    /// Output lines kept for diagnostics.
    pub tail_lines: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Docker,
            image: "colmap/colmap:latest".to_string(),
            cpus: None,
            memory: None,
            gpus: None,
            instance: "default".to_string(),
            tail_lines: 40,
        }
    }
}

impl RunnerConfig {
    pub fn local() -> Self {
        Self {
            backend: Backend::Local,
            ..Self::default()
        }
    }

    /// Read `RUNNER_BACKEND`, `RUNNER_IMAGE`, `RUNNER_CPUS`, `RUNNER_MEMORY`,
    /// `RUNNER_GPUS`, `RUNNER_INSTANCE` and `RUNNER_TAIL_LINES`.
    pub fn from_env() -> Result<Self, RunnerError> {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        Ok(Self {
            backend: match var("RUNNER_BACKEND") {
                Some(b) => b.parse()?,
                None => defaults.backend,
            },
            image: var("RUNNER_IMAGE").unwrap_or(defaults.image),
            cpus: var("RUNNER_CPUS"),
            memory: var("RUNNER_MEMORY"),
            gpus: var("RUNNER_GPUS"),
            instance: var("RUNNER_INSTANCE")
                .or_else(|| var("HOSTNAME"))
                .unwrap_or(defaults.instance),
            tail_lines: var("RUNNER_TAIL_LINES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.tail_lines),
        })
    }

    /// Build the runner selected by `backend`.
    pub fn build(&self) -> Arc<dyn ProcessRunner> {
        match self.backend {
            Backend::Docker => Arc::new(ContainerRunner::new("docker", self.clone())),
            Backend::Podman => Arc::new(ContainerRunner::new("podman", self.clone())),
            Backend::Local => Arc::new(LocalRunner::new(self.tail_lines)),
        }
    }
}
