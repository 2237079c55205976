//! Supervised external processes.
//!
//! A [`ProcessHandle`] owns one spawned tool. Its stderr is drained into a
//! bounded [`TailBuffer`] for the whole lifetime of the process, and a waiter
//! task reaps the child, killing it as soon as the owning run is terminated.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use process_utils::TailBuffer;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::command::ToolCommand;
use super::run::PipelineRun;
use crate::error::{Error, Result};

/// How long to keep draining stderr after the process is gone. A grandchild
/// holding the pipe open must not stall the exit report.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Longest stderr line decoded in one piece.
const STDERR_LINE_MAX: u64 = 64 * 1024;

/// Role of a process inside a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extractor,
    Transcoder,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extractor => "extractor",
            Self::Transcoder => "transcoder",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of a process, published once it has been reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitState {
    /// Exit code; `None` when the process died from a signal.
    pub code: Option<i32>,
    /// Whether the run killed the process.
    pub killed: bool,
    /// Accumulated stderr, bounded.
    pub diagnostics: String,
}

impl ExitState {
    pub fn success(&self) -> bool {
        !self.killed && self.code == Some(0)
    }

    /// Human readable description used when the process failed.
    pub fn describe(&self, tool: &str) -> String {
        let trimmed = self.diagnostics.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
        match self.code {
            Some(code) => format!("{tool} process exited with code {code}"),
            None => format!("{tool} process was terminated by a signal"),
        }
    }
}

/// Which standard streams of a stage are piped back to the pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StageIo {
    pub stdin: bool,
    pub stdout: bool,
}

impl StageIo {
    pub const NONE: Self = Self {
        stdin: false,
        stdout: false,
    };
    pub const STDOUT: Self = Self {
        stdin: false,
        stdout: true,
    };
    pub const DUPLEX: Self = Self {
        stdin: true,
        stdout: true,
    };
}

/// One spawned external process, owned by the run that spawned it.
pub struct ProcessHandle {
    stage: Stage,
    tool: String,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    exit: watch::Receiver<Option<ExitState>>,
}

impl ProcessHandle {
    /// Spawn `tool` for `stage` and register it with `run`.
    pub(crate) fn spawn(
        stage: Stage,
        tool: &ToolCommand,
        args: &[String],
        io: StageIo,
        run: &PipelineRun,
        diagnostic_limit: usize,
    ) -> Result<Self> {
        let mut command = tool.command();
        command
            .args(args)
            .stdout(if io.stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());
        if io.stdin {
            command.stdin(Stdio::piped());
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::spawn(tool.program(), e))?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        let diagnostics = Arc::new(Mutex::new(TailBuffer::new(diagnostic_limit)));
        let drain = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_drain(stage, run.id().to_string(), stderr, diagnostics.clone()));

        let (exit_tx, exit_rx) = watch::channel(None);
        spawn_process_waiter(stage, child, run.token(), drain, diagnostics, exit_tx);
        run.attach(stage, exit_rx.clone());

        debug!(run_id = %run.id(), %stage, pid, tool = %tool.program(), ?args, "Spawned process");

        Ok(Self {
            stage,
            tool: tool.program().to_string(),
            pid,
            stdin,
            stdout,
            exit: exit_rx,
        })
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.stdin
            .take()
            .ok_or_else(|| Error::Other(format!("Failed to capture {} stdin", self.stage)))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.stdout
            .take()
            .ok_or_else(|| Error::Other(format!("Failed to capture {} stdout", self.stage)))
    }

    /// Wait until the process has been reaped. Bounded whenever the run is
    /// terminated, since termination kills the process.
    pub async fn wait(&self) -> ExitState {
        wait_exit(self.exit.clone()).await
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("stage", &self.stage)
            .field("tool", &self.tool)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

pub(crate) async fn wait_exit(mut rx: watch::Receiver<Option<ExitState>>) -> ExitState {
    match rx.wait_for(Option::is_some).await {
        Ok(state) => state.clone().unwrap_or_else(lost_exit_state),
        Err(_) => lost_exit_state(),
    }
}

fn lost_exit_state() -> ExitState {
    ExitState {
        code: None,
        killed: false,
        diagnostics: "process waiter ended without reporting an exit status".to_string(),
    }
}

/// Spawn a task that reaps `child` and publishes its [`ExitState`].
///
/// If `cancellation_token` fires first the process is killed outright; the
/// pipeline never waits for a voluntary shutdown.
fn spawn_process_waiter(
    stage: Stage,
    mut child: Child,
    cancellation_token: CancellationToken,
    drain: Option<JoinHandle<()>>,
    diagnostics: Arc<Mutex<TailBuffer>>,
    exit_tx: watch::Sender<Option<ExitState>>,
) {
    tokio::spawn(async move {
        let (code, killed) = tokio::select! {
            biased;
            status = child.wait() => match status {
                Ok(exit_status) => {
                    let code = exit_status.code();
                    if code != Some(0) {
                        debug!(%stage, ?code, "Process exited unsuccessfully");
                    }
                    (code, false)
                }
                Err(e) => {
                    error!(%stage, "Error waiting for process: {}", e);
                    (None, false)
                }
            },
            _ = cancellation_token.cancelled() => {
                debug!(%stage, "Run terminated, killing process");
                if let Err(e) = child.kill().await {
                    warn!(%stage, "Failed to kill process: {}", e);
                }
                (None, true)
            }
        };

        if let Some(mut drain) = drain
            && tokio::time::timeout(STDERR_DRAIN_GRACE, &mut drain)
                .await
                .is_err()
        {
            debug!(%stage, "stderr still open after exit, keeping partial diagnostics");
            drain.abort();
        }

        let diagnostics = diagnostics.lock().snapshot();
        let _ = exit_tx.send(Some(ExitState {
            code,
            killed,
            diagnostics,
        }));
    });
}

/// Continuously copy a process's stderr into its diagnostic buffer.
///
/// Text is decoded a whole line at a time, so multibyte characters are never
/// split between reads. Lines longer than [`STDERR_LINE_MAX`] are cut.
fn spawn_stderr_drain(
    stage: Stage,
    run_id: String,
    stderr: ChildStderr,
    diagnostics: Arc<Mutex<TailBuffer>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::with_capacity(256);
        loop {
            line.clear();
            let read = (&mut reader)
                .take(STDERR_LINE_MAX)
                .read_until(b'\n', &mut line)
                .await;
            match read {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    for part in text.split(['\n', '\r']).filter(|l| !l.trim().is_empty()) {
                        debug!(target: "media_relay::tool", run_id = %run_id, %stage, "{}", part);
                    }
                    diagnostics.lock().push_str(&text);
                }
                Err(e) => {
                    warn!(%stage, "Error reading stderr: {}", e);
                    break;
                }
            }
        }
    })
}
