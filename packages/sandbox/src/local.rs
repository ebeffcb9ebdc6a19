//! Direct process backend for development and tests.
//!
//! There is no isolation: mount points are rewritten to their host
//! directories and the program runs in its own process group so a timeout
//! takes down everything it spawned.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tokio::process::Command;
use tokio::sync::watch;

use crate::process::{self, ProgressSink};
use crate::{Invocation, RunFuture, RunOutput, RunnerError};

// A mount point at the start of a token or after `=`, `:` or a quote.
static MOUNT_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[\s=:'"])(/[A-Za-z0-9_.-]+)\b"#).expect("static regex")
});

pub struct LocalRunner {
    tail_lines: usize,
    shutdown: watch::Sender<bool>,
}

impl LocalRunner {
    pub fn new(tail_lines: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tail_lines,
            shutdown,
        }
    }

    /// Replace container mount points in `text` by their host directories.
    fn map_paths(invocation: &Invocation, text: &str) -> String {
        MOUNT_REF
            .replace_all(text, |caps: &Captures<'_>| {
                let prefix = &caps[1];
                let target = &caps[2];
                match invocation.host_path_for(target) {
                    Some(host) => format!("{prefix}{}", host.display()),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
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

        let program = Self::map_paths(&invocation, &invocation.program);
        let mut cmd = Command::new(&program);
        cmd.args(invocation.args.iter().map(|a| Self::map_paths(&invocation, a)));
        if let Some(dir) = invocation.host_path_for(&invocation.workdir) {
            cmd.current_dir(dir);
        }
        process::prepare(&mut cmd);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = process::spawn(&mut cmd, &program)?;
        let pid = child.id();
        tracing::debug!(
            job_id = %invocation.job_id,
            stage = %invocation.stage,
            ?pid,
            "local process started"
        );

        process::supervise(
            child,
            &invocation,
            self.tail_lines,
            &progress,
            self.shutdown.subscribe(),
            move || async move { kill_group(pid) },
        )
        .await
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        // SAFETY: killpg only sends a signal; the group was created for this child.
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

impl crate::ProcessRunner for LocalRunner {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn run(&self, invocation: Invocation, progress: ProgressSink) -> RunFuture<'_, RunOutput> {
        Box::pin(self.execute(invocation, progress))
    }

    fn shutdown(&self) -> RunFuture<'_, ()> {
        self.shutdown.send_replace(true);
        Box::pin(async { Ok(()) })
    }

    fn reap_orphans(&self) -> RunFuture<'_, usize> {
        Box::pin(async { Ok(0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mount;
    use scan_core::{JobId, ToolCommand};

    #[test]
    fn rewrites_mount_points_only() {
        let inv = Invocation::new(JobId::new(), "s", ToolCommand::new("true", &[]))
            .with_mount(Mount::read_write("/data/ws/1/work", "/work"))
            .with_mount(Mount::read_only("/data/ws/1/input", "/input"));
        assert_eq!(
            LocalRunner::map_paths(&inv, "/work/images"),
            "/data/ws/1/work/images"
        );
        assert_eq!(
            LocalRunner::map_paths(&inv, "--path=/input/bundle.zip"),
            "--path=/data/ws/1/input/bundle.zip"
        );
        assert_eq!(
            LocalRunner::map_paths(&inv, "ls /work && cat /input/x"),
            "ls /data/ws/1/work && cat /data/ws/1/input/x"
        );
        assert_eq!(LocalRunner::map_paths(&inv, "/workspace/a"), "/workspace/a");
        assert_eq!(LocalRunner::map_paths(&inv, "/tmp/work"), "/tmp/work");
    }
}
