//! Live state of one orchestration run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{ExitState, Stage, wait_exit};
use crate::error::{Error, ErrorKind};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Outcome {
    #[default]
    Pending,
    Success,
    Failed {
        kind: ErrorKind,
        message: String,
    },
    TimedOut,
    ClientCancelled,
}

impl Outcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Outcome recorded when a run ends with `err`.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Timeout(_) => Self::TimedOut,
            Error::ClientCancelled => Self::ClientCancelled,
            Error::Upstream { kind, message } => Self::Failed {
                kind: *kind,
                message: message.clone(),
            },
            Error::Transcode(message) => Self::Failed {
                kind: ErrorKind::TranscodeError,
                message: message.clone(),
            },
            other => Self::Failed {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

struct RunShared {
    id: String,
    token: CancellationToken,
    terminated: AtomicBool,
    outcome: watch::Sender<Outcome>,
    processes: Mutex<Vec<(Stage, watch::Receiver<Option<ExitState>>)>>,
    timeout: Duration,
}

/// Shared handle to a running pipeline.
///
/// The first call to [`PipelineRun::terminate`] records the outcome, kills
/// every live process of the run and disarms the deadline timer. Later calls
/// do nothing.
#[derive(Clone)]
pub struct PipelineRun {
    shared: Arc<RunShared>,
}

impl PipelineRun {
    /// Create a run and arm its deadline timer.
    pub fn start(deadline: Instant) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let (outcome, _) = watch::channel(Outcome::Pending);
        let run = Self {
            shared: Arc::new(RunShared {
                id,
                token: CancellationToken::new(),
                terminated: AtomicBool::new(false),
                outcome,
                processes: Mutex::new(Vec::with_capacity(2)),
                timeout: deadline.saturating_duration_since(Instant::now()),
            }),
        };

        let timer = run.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if timer.terminate(Outcome::TimedOut) {
                        warn!(run_id = %timer.id(), timeout_ms = timer.shared.timeout.as_millis() as u64, "Run deadline exceeded");
                    }
                }
                _ = timer.shared.token.cancelled() => {}
            }
        });

        run
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Token cancelled exactly when the run terminates.
    pub fn token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    /// Record `outcome` and tear the run down. Returns `false` if the run had
    /// already been terminated, in which case nothing changes.
    pub fn terminate(&self, outcome: Outcome) -> bool {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(run_id = %self.id(), ?outcome, "Terminating run");
        self.shared.outcome.send_replace(outcome);
        self.shared.token.cancel();
        true
    }

    /// Terminate the run with `err`. If the run had already ended, the error
    /// describing how it actually ended is returned instead.
    pub fn fail(&self, err: Error) -> Error {
        if self.terminate(Outcome::from_error(&err)) {
            info!(run_id = %self.id(), code = err.code(), "Run failed: {}", err);
            err
        } else {
            self.ended_error().unwrap_or(err)
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.shared.outcome.borrow().clone()
    }

    /// Wait until an outcome has been recorded.
    pub async fn finished(&self) -> Outcome {
        let mut rx = self.shared.outcome.subscribe();
        match rx.wait_for(|o| !o.is_pending()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => self.outcome(),
        }
    }

    /// The error matching the recorded outcome, if the run did not succeed.
    pub fn ended_error(&self) -> Option<Error> {
        match self.outcome() {
            Outcome::Pending | Outcome::Success => None,
            Outcome::TimedOut => Some(Error::Timeout(self.shared.timeout)),
            Outcome::ClientCancelled => Some(Error::ClientCancelled),
            Outcome::Failed {
                kind: ErrorKind::TranscodeError,
                message,
            } => Some(Error::Transcode(message)),
            Outcome::Failed { kind, message } => Some(Error::upstream(kind, message)),
        }
    }

    pub(crate) fn attach(&self, stage: Stage, exit: watch::Receiver<Option<ExitState>>) {
        self.shared.processes.lock().push((stage, exit));
    }

    /// Stages spawned so far, in spawn order.
    pub fn stages(&self) -> Vec<Stage> {
        self.shared
            .processes
            .lock()
            .iter()
            .map(|(stage, _)| *stage)
            .collect()
    }

    /// Exit state of `stage`, if it was spawned and has been reaped.
    pub fn exit_state(&self, stage: Stage) -> Option<ExitState> {
        self.shared
            .processes
            .lock()
            .iter()
            .find(|(s, _)| *s == stage)
            .and_then(|(_, rx)| rx.borrow().clone())
    }

    /// Wait until every spawned process has been reaped.
    pub async fn wait_processes(&self) -> Vec<(Stage, ExitState)> {
        let receivers: Vec<_> = self.shared.processes.lock().clone();
        let mut states = Vec::with_capacity(receivers.len());
        for (stage, rx) in receivers {
            states.push((stage, wait_exit(rx).await));
        }
        states
    }

    /// Guard that terminates the run as client-cancelled if dropped while armed.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            run: self.clone(),
            armed: true,
        }
    }
}

impl std::fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("id", &self.shared.id)
            .field("terminated", &self.is_terminated())
            .field("outcome", &self.outcome())
            .finish()
    }
}

/// Terminates its run when dropped, unless disarmed.
///
/// Held by whatever currently represents the client: the request handler
/// future, then the response body.
#[derive(Debug)]
pub struct CancelOnDrop {
    run: PipelineRun,
    armed: bool,
}

impl CancelOnDrop {
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed && self.run.terminate(Outcome::ClientCancelled) {
            info!(run_id = %self.run.id(), "Client went away, run cancelled");
        }
    }
}
