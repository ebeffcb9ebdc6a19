//! Sandboxed execution of the reconstruction tool.
//!
//! A [`ProcessRunner`] runs one stage invocation with only its declared
//! mounts visible, streams output into a bounded tail and structured
//! progress, and guarantees the process is gone on timeout or shutdown.
//! It never retries.

mod config;
mod container;
mod error;
mod invocation;
mod local;
mod process;
mod progress;

use std::future::Future;
use std::pin::Pin;

pub use config::{Backend, RunnerConfig};
pub use container::{ContainerRunner, INSTANCE_LABEL};
pub use error::RunnerError;
pub use invocation::{INPUT_MOUNT, Invocation, Mount, RunOutput, WORK_MOUNT};
pub use local::LocalRunner;
pub use process::{OutputTail, ProgressSink};
pub use progress::{ProgressParser, ToolProgress};

/// Boxed future returned by runner operations.
pub type RunFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RunnerError>> + Send + 'a>>;

/// Executes tool invocations in isolation.
pub trait ProcessRunner: Send + Sync + 'static {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Run one invocation to completion. Progress parsed from the tool's
    /// output is sent to `progress` as it arrives.
    fn run(&self, invocation: Invocation, progress: ProgressSink) -> RunFuture<'_, RunOutput>;

    /// Terminate every running invocation; later runs fail with
    /// [`RunnerError::Shutdown`].
    fn shutdown(&self) -> RunFuture<'_, ()>;

    /// Remove processes left behind by a previous instance. Returns how many
    /// were found.
    fn reap_orphans(&self) -> RunFuture<'_, usize>;
}
