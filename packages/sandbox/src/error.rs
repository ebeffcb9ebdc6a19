use std::time::Duration;

/// Why a tool invocation did not succeed. The runner never retries; the
/// caller decides what to do with each variant.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The invocation outlived its deadline and was forcibly terminated.
    #[error("stage {stage} timed out after {}s", timeout.as_secs())]
    Timeout {
        stage: String,
        timeout: Duration,
        tail: String,
    },

    /// The tool ran and exited unsuccessfully.
    #[error("stage {stage} exited with {}", describe_exit(*exit_code))]
    Execution {
        stage: String,
        /// `None` when the process was killed by a signal.
        exit_code: Option<i32>,
        tail: String,
    },

    /// The tool or container engine could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The runner is shutting down; the process was terminated.
    #[error("runner is shutting down")]
    Shutdown,

    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

impl RunnerError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunnerError::Execution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Last lines of tool output captured before the failure.
    pub fn tail(&self) -> &str {
        match self {
            RunnerError::Timeout { tail, .. } | RunnerError::Execution { tail, .. } => tail,
            _ => "",
        }
    }
}
