//! Child process supervision shared by every backend.

use std::collections::VecDeque;
use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::progress::{ProgressParser, ToolProgress};
use crate::{Invocation, RunOutput, RunnerError};

/// Longest line kept in the output tail.
const MAX_LINE_CHARS: usize = 512;
/// How long to keep reading output after the process exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Sender side of structured progress for one invocation.
pub type ProgressSink = mpsc::UnboundedSender<ToolProgress>;

/// Bounded window over the last lines a tool printed.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
    seen: u64,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            seen: 0,
        }
    }

    pub fn push(&mut self, line: &str) {
        self.seen += 1;
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        let line = match line.char_indices().nth(MAX_LINE_CHARS) {
            Some((cut, _)) => format!("{}...", &line[..cut]),
            None => line.to_string(),
        };
        self.lines.push_back(line);
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Pipe both output streams and make sure the child dies with its handle.
pub(crate) fn prepare(cmd: &mut Command) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
}

pub(crate) fn spawn(cmd: &mut Command, program: &str) -> Result<Child, RunnerError> {
    cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: program.to_string(),
        source,
    })
}

/// Forward every output line, decoding lossily. Reading continues until the
/// stream closes so the child never blocks on a full pipe.
async fn forward_lines<R: AsyncRead + Unpin>(stream: Option<R>, tx: mpsc::Sender<String>) {
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !forwarding {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                tracing::debug!("tool output stream closed: {}", e);
                break;
            }
        }
    }
}

enum Outcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Shutdown,
}

/// Drive a spawned child to completion.
///
/// Output lines feed the tail and the progress parser as they arrive. On
/// timeout or shutdown `terminate` runs first, then the child handle is
/// killed.
pub(crate) async fn supervise<F, Fut>(
    mut child: Child,
    invocation: &Invocation,
    tail_lines: usize,
    progress: &ProgressSink,
    mut shutdown: watch::Receiver<bool>,
    terminate: F,
) -> Result<RunOutput, RunnerError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let started = Instant::now();
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    tokio::spawn(forward_lines(child.stdout.take(), line_tx.clone()));
    tokio::spawn(forward_lines(child.stderr.take(), line_tx));

    let mut tail = OutputTail::new(tail_lines);
    let mut parser = ProgressParser::new(invocation.progress, invocation.expected_total);
    let mut record = |line: String, tail: &mut OutputTail| {
        if let Some(update) = parser.parse(&line) {
            let _ = progress.send(update);
        }
        tail.push(&line);
    };

    let deadline = tokio::time::sleep(invocation.timeout);
    tokio::pin!(deadline);

    let outcome = if *shutdown.borrow() {
        Outcome::Shutdown
    } else {
        loop {
            tokio::select! {
                Some(line) = line_rx.recv() => record(line, &mut tail),
                status = child.wait() => {
                    let status = status.map_err(|source| RunnerError::Spawn {
                        program: invocation.program.clone(),
                        source,
                    })?;
                    break Outcome::Exited(status);
                }
                _ = &mut deadline => break Outcome::TimedOut,
                _ = shutdown.changed() => break Outcome::Shutdown,
            }
        }
    };

    match outcome {
        Outcome::Exited(status) => {
            let _ = tokio::time::timeout(DRAIN_GRACE, async {
                while let Some(line) = line_rx.recv().await {
                    record(line, &mut tail);
                }
            })
            .await;

            let output = RunOutput {
                exit_code: status.code().unwrap_or(-1),
                output_tail: tail.render(),
                lines: tail.seen(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
            if status.success() {
                Ok(output)
            } else {
                Err(RunnerError::Execution {
                    stage: invocation.stage.clone(),
                    exit_code: status.code(),
                    tail: output.output_tail,
                })
            }
        }
        Outcome::TimedOut => {
            tracing::warn!(
                job_id = %invocation.job_id,
                stage = %invocation.stage,
                timeout_secs = invocation.timeout.as_secs(),
                "invocation timed out, terminating"
            );
            terminate().await;
            let _ = child.kill().await;
            while let Ok(line) = line_rx.try_recv() {
                record(line, &mut tail);
            }
            Err(RunnerError::Timeout {
                stage: invocation.stage.clone(),
                timeout: invocation.timeout,
                tail: tail.render(),
            })
        }
        Outcome::Shutdown => {
            tracing::info!(
                job_id = %invocation.job_id,
                stage = %invocation.stage,
                "runner shutting down, terminating invocation"
            );
            terminate().await;
            let _ = child.kill().await;
            Err(RunnerError::Shutdown)
        }
    }
}
