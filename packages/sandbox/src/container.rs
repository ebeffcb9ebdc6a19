//! Container backend (`docker` or `podman`).
//!
//! Each invocation becomes one `run --rm` with only the declared mounts and
//! no network. Containers carry a label naming the orchestrator instance so
//! leftovers of a crashed process can be found and removed at startup.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::Command;
use tokio::sync::{Mutex, watch};

use crate::process::{self, ProgressSink};
use crate::{Invocation, RunFuture, RunOutput, RunnerConfig, RunnerError};

/// Label key attached to every container this orchestrator starts.
pub const INSTANCE_LABEL: &str = "scan-orchestrator";

pub struct ContainerRunner {
    engine: String,
    config: RunnerConfig,
    sequence: AtomicU64,
    active: Arc<Mutex<HashSet<String>>>,
    shutdown: watch::Sender<bool>,
}

impl ContainerRunner {
    pub fn new(engine: impl Into<String>, config: RunnerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine: engine.into(),
            config,
            sequence: AtomicU64::new(0),
            active: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    fn container_name(&self, invocation: &Invocation) -> String {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        let stage: String = invocation
            .stage
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("scan-{}-{stage}-{n}", invocation.job_id)
    }

    /// Arguments for the engine CLI, starting at `run`.
    pub fn run_args(&self, name: &str, invocation: &Invocation) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            format!("{INSTANCE_LABEL}={}", self.config.instance),
            "--network".into(),
            "none".into(),
        ];
        for mount in &invocation.mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push("-v".into());
            args.push(format!(
                "{}:{}:{mode}",
                mount.host.display(),
                mount.container
            ));
        }
        args.push("-w".into());
        args.push(invocation.workdir.clone());
        if let Some(cpus) = &self.config.cpus {
            args.push("--cpus".into());
            args.push(cpus.clone());
        }
        if let Some(memory) = &self.config.memory {
            args.push("--memory".into());
            args.push(memory.clone());
        }
        if let Some(gpus) = &self.config.gpus {
            if self.engine == "podman" {
                args.push("--device".into());
                args.push(format!("nvidia.com/gpu={gpus}"));
            } else {
                args.push("--gpus".into());
                args.push(gpus.clone());
            }
        }
        args.push(self.config.image.clone());
        args.push(invocation.program.clone());
        args.extend(invocation.args.iter().cloned());
        args
    }

    async fn execute(
        &self,
        invocation: Invocation,
        progress: ProgressSink,
    ) -> Result<RunOutput, RunnerError> {
        invocation.validate()?;
        if *self.shutdown.borrow() {
            return Err(RunnerError::Shutdown);
        }

        let name = self.container_name(&invocation);
        let mut cmd = Command::new(&self.engine);
        cmd.args(self.run_args(&name, &invocation));
        process::prepare(&mut cmd);

        let child = process::spawn(&mut cmd, &self.engine)?;
        self.active.lock().await.insert(name.clone());
        tracing::debug!(
            job_id = %invocation.job_id,
            stage = %invocation.stage,
            container = %name,
            "container started"
        );

        let result = process::supervise(
            child,
            &invocation,
            self.config.tail_lines,
            &progress,
            self.shutdown.subscribe(),
            || remove_container(&self.engine, &name),
        )
        .await;

        self.active.lock().await.remove(&name);
        result
    }

    async fn stop_all(&self) -> Result<(), RunnerError> {
        self.shutdown.send_replace(true);
        let names: Vec<String> = self.active.lock().await.drain().collect();
        for name in names {
            remove_container(&self.engine, &name).await;
        }
        Ok(())
    }

    /// Remove containers labelled with this instance that no live invocation owns.
    async fn reap(&self) -> Result<usize, RunnerError> {
        let filter = format!("label={INSTANCE_LABEL}={}", self.config.instance);
        let output = Command::new(&self.engine)
            .args(["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"])
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: self.engine.clone(),
                source,
            })?;
        let ids = {
            let active = self.active.lock().await;
            orphaned(&String::from_utf8_lossy(&output.stdout), &active)
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let status = Command::new(&self.engine)
            .arg("rm")
            .arg("-f")
            .args(&ids)
            .output()
            .await
            .map_err(|source| RunnerError::Spawn {
                program: self.engine.clone(),
                source,
            })?;
        if !status.status.success() {
            tracing::warn!(
                stderr = %String::from_utf8_lossy(&status.stderr),
                "failed to remove some orphaned containers"
            );
        }
        tracing::info!(count = ids.len(), instance = %self.config.instance, "reaped orphaned containers");
        Ok(ids.len())
    }
}

/// Container names from a `ps` listing that no running invocation owns.
fn orphaned(listing: &str, active: &HashSet<String>) -> Vec<String> {
    listing
        .split_whitespace()
        .filter(|name| !active.contains(*name))
        .map(str::to_string)
        .collect()
}

async fn remove_container(engine: &str, name: &str) {
    match Command::new(engine)
        .args(["rm", "-f", name])
        .output()
        .await
    {
        Ok(out) if out.status.success() => {
            tracing::debug!(container = %name, "container removed");
        }
        Ok(out) => tracing::warn!(
            container = %name,
            stderr = %String::from_utf8_lossy(&out.stderr),
            "container removal failed"
        ),
        Err(e) => tracing::warn!(container = %name, error = %e, "container removal failed"),
    }
}

impl crate::ProcessRunner for ContainerRunner {
    fn backend(&self) -> &'static str {
        if self.engine == "podman" { "podman" } else { "docker" }
    }

    fn run(&self, invocation: Invocation, progress: ProgressSink) -> RunFuture<'_, RunOutput> {
        Box::pin(self.execute(invocation, progress))
    }

    fn shutdown(&self) -> RunFuture<'_, ()> {
        Box::pin(self.stop_all())
    }

    fn reap_orphans(&self) -> RunFuture<'_, usize> {
        Box::pin(self.reap())
    }
}
