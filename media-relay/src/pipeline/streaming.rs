//! Streaming delivery: extractor stdout piped into the transcoder, transcoder
//! stdout streamed to the client.
//!
//! The transcoder is spawned once the extractor has produced its first bytes,
//! and [`Pipeline::stream`] returns only after the transcoder has produced its
//! first bytes. Until then every failure is still reportable as an error
//! response; afterwards failures are logged and abort the body.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, ChildStdout};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::command::{MediaSelection, MediaSink, TranscodeEndpoint, extractor_media_args, transcoder_args};
use super::process::{ExitState, ProcessHandle, Stage, StageIo};
use super::request::{AudioFormat, PipelineRequest};
use super::run::{CancelOnDrop, Outcome, PipelineRun};
use super::{Pipeline, extractor_error};
use crate::error::{Error, ErrorKind, Result};

/// Chunk size of the extractor-to-transcoder pump and of the response body.
const PIPE_CHUNK: usize = 8 * 1024;

/// How long a failed transcoder waits for the extractor's own verdict, which
/// is the more useful error when both die together.
const EXTRACTOR_VERDICT_GRACE: Duration = Duration::from_millis(250);

/// A committed streaming run: the transcoder has started producing output.
pub struct AudioStream {
    format: AudioFormat,
    run: PipelineRun,
    first: Bytes,
    output: ReaderStream<ChildStdout>,
    guard: CancelOnDrop,
}

impl AudioStream {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    /// Turn the stream into a response body.
    ///
    /// Dropping the body before it has been fully read (client disconnect)
    /// terminates the run. If the run fails after output started, the body
    /// ends with an error so the transfer is visibly aborted.
    pub fn into_body_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        let state = BodyState {
            first: Some(self.first),
            output: self.output,
            run: self.run,
            guard: self.guard,
            done: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            if let Some(first) = state.first.take() {
                return Some((Ok(first), state));
            }

            match state.output.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), state)),
                Some(Err(e)) => {
                    state.done = true;
                    let err = state.run.fail(Error::Transcode(format!(
                        "reading transcoder output: {e}"
                    )));
                    warn!(run_id = %state.run.id(), "Streaming failed after headers were sent: {}", err);
                    Some((Err(std::io::Error::other(err.to_string())), state))
                }
                None => {
                    state.done = true;
                    let outcome = state.run.finished().await;
                    state.guard.disarm();
                    match outcome {
                        Outcome::Success => {
                            info!(run_id = %state.run.id(), "Streaming run completed");
                            None
                        }
                        other => {
                            warn!(run_id = %state.run.id(), outcome = ?other, "Streaming run ended unsuccessfully after headers were sent");
                            let message = state
                                .run
                                .ended_error()
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "stream ended unexpectedly".to_string());
                            Some((Err(std::io::Error::other(message)), state))
                        }
                    }
                }
            }
        })
    }
}

struct BodyState {
    first: Option<Bytes>,
    output: ReaderStream<ChildStdout>,
    run: PipelineRun,
    guard: CancelOnDrop,
    done: bool,
}

/// Next chunk from `stream`, or `None` once the run has been terminated.
/// Data already buffered wins over termination.
async fn next_or_terminated(
    run: &PipelineRun,
    stream: &mut ReaderStream<ChildStdout>,
) -> Option<std::io::Result<Bytes>> {
    let token = run.token();
    tokio::select! {
        biased;
        chunk = stream.next() => chunk,
        _ = token.cancelled() => None,
    }
}

impl Pipeline {
    /// Start a streaming run for `request`.
    ///
    /// Resolves once the transcoder has produced output, or with the error
    /// that ended the run before that point.
    pub async fn stream(&self, request: &PipelineRequest) -> Result<AudioStream> {
        let run = PipelineRun::start(request.deadline());
        let guard = run.cancel_on_drop();
        info!(
            run_id = %run.id(),
            source = %request.source(),
            format = %request.format(),
            proxy = request.proxy().is_some(),
            "Starting streaming run"
        );

        let args = extractor_media_args(request, MediaSelection::BestAudio, MediaSink::Stdout);
        let mut extractor = ProcessHandle::spawn(
            Stage::Extractor,
            &self.config.extractor,
            &args,
            StageIo::STDOUT,
            &run,
            self.config.diagnostic_limit,
        )
        .map_err(|e| run.fail(e))?;
        let mut source = ReaderStream::with_capacity(
            extractor.take_stdout().map_err(|e| run.fail(e))?,
            PIPE_CHUNK,
        );

        let first_input = match next_or_terminated(&run, &mut source).await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                return Err(run.fail(Error::upstream(
                    ErrorKind::UpstreamError,
                    format!("reading extractor output: {e}"),
                )));
            }
            None => {
                let exit = extractor.wait().await;
                return Err(run.fail(silent_extractor_error(&exit)));
            }
        };
        debug!(run_id = %run.id(), bytes = first_input.len(), "Extractor produced output, starting transcoder");

        let args = transcoder_args(
            request.format(),
            TranscodeEndpoint::Pipe,
            TranscodeEndpoint::Pipe,
        );
        let mut transcoder = ProcessHandle::spawn(
            Stage::Transcoder,
            &self.config.transcoder,
            &args,
            StageIo::DUPLEX,
            &run,
            self.config.diagnostic_limit,
        )
        .map_err(|e| run.fail(e))?;
        let stdin = transcoder.take_stdin().map_err(|e| run.fail(e))?;
        let mut output = ReaderStream::with_capacity(
            transcoder.take_stdout().map_err(|e| run.fail(e))?,
            PIPE_CHUNK,
        );

        let input_closed = Arc::new(AtomicBool::new(false));
        spawn_pump(run.clone(), first_input, source, stdin, input_closed.clone());
        spawn_supervisor(run.clone(), extractor, transcoder, input_closed);

        let first = match next_or_terminated(&run, &mut output).await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                return Err(run.fail(Error::Transcode(format!(
                    "reading transcoder output: {e}"
                ))));
            }
            None => match run.finished().await {
                // Exited cleanly before we got to read; the pipe still holds its output.
                Outcome::Success => match output.next().await {
                    Some(Ok(chunk)) => chunk,
                    _ => {
                        warn!(run_id = %run.id(), "Transcoder exited cleanly without output");
                        return Err(Error::Transcode("transcoder produced no output".into()));
                    }
                },
                _ => {
                    return Err(run
                        .ended_error()
                        .unwrap_or_else(|| Error::Transcode("transcoder produced no output".into())));
                }
            },
        };

        debug!(run_id = %run.id(), "Transcoder produced output, committing response");
        Ok(AudioStream {
            format: request.format(),
            run,
            first,
            output,
            guard,
        })
    }
}

/// Error for an extractor that closed its output without writing anything.
fn silent_extractor_error(exit: &ExitState) -> Error {
    if exit.success() {
        Error::upstream(ErrorKind::UpstreamError, "extractor produced no output")
    } else {
        extractor_error(exit)
    }
}

/// Copy extractor output into the transcoder's stdin.
///
/// One chunk is in flight at a time, so a slow transcoder (or a slow client
/// behind it) blocks the extractor on its pipe. Dropping stdin at the end
/// signals end of input. `input_closed` is set before the extractor's output
/// is dropped when the transcoder stops accepting input.
fn spawn_pump(
    run: PipelineRun,
    first: Bytes,
    mut source: ReaderStream<ChildStdout>,
    mut stdin: ChildStdin,
    input_closed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let token = run.token();
        let mut pending = Some(first);

        loop {
            let chunk = match pending.take() {
                Some(chunk) => chunk,
                None => tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = source.next() => match chunk {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => {
                            warn!(run_id = %run.id(), "Error reading extractor output: {}", e);
                            break;
                        }
                        None => break,
                    }
                },
            };
            if stdin.write_all(&chunk).await.is_err() {
                input_closed.store(true, Ordering::Release);
                debug!(run_id = %run.id(), "Transcoder closed its input");
                break;
            }
        }
    });
}

/// Watch both processes and decide the run's outcome.
///
/// A failed extractor takes precedence over a failed transcoder, except when
/// the transcoder had already stopped reading: the extractor then only died
/// of the broken pipe and the transcoder's diagnostics are the real cause.
fn spawn_supervisor(
    run: PipelineRun,
    extractor: ProcessHandle,
    transcoder: ProcessHandle,
    input_closed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let token = run.token();
        let broken_pipe = || input_closed.load(Ordering::Acquire);
        let mut extractor_exit: Option<ExitState> = None;

        let transcoder_exit = loop {
            tokio::select! {
                state = extractor.wait(), if extractor_exit.is_none() => {
                    if state.killed {
                        return;
                    }
                    if !state.success() && !broken_pipe() {
                        run.fail(extractor_error(&state));
                        return;
                    }
                    debug!(run_id = %run.id(), code = ?state.code, "Extractor finished");
                    extractor_exit = Some(state);
                }
                state = transcoder.wait() => break state,
                _ = token.cancelled() => return,
            }
        };

        if transcoder_exit.killed {
            return;
        }
        if !transcoder_exit.success() {
            let extractor_exit = match extractor_exit {
                Some(state) => Some(state),
                None => tokio::time::timeout(EXTRACTOR_VERDICT_GRACE, extractor.wait())
                    .await
                    .ok(),
            };
            let err = match extractor_exit {
                Some(state) if !state.success() && !state.killed && !broken_pipe() => {
                    extractor_error(&state)
                }
                _ => Error::Transcode(transcoder_exit.describe(transcoder.tool())),
            };
            run.fail(err);
            return;
        }

        let extractor_exit = match extractor_exit {
            Some(state) => state,
            None => tokio::select! {
                state = extractor.wait() => state,
                _ = token.cancelled() => return,
            },
        };
        if extractor_exit.success() || broken_pipe() {
            // A transcoder that exits cleanly without reading everything has
            // finished its output; the extractor's SIGPIPE is expected then.
            run.terminate(Outcome::Success);
        } else if !extractor_exit.killed {
            run.fail(extractor_error(&extractor_exit));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(code: i32, diagnostics: &str) -> ExitState {
        ExitState {
            code: Some(code),
            killed: false,
            diagnostics: diagnostics.to_string(),
        }
    }

    #[test]
    fn silent_clean_exit_is_an_upstream_error() {
        let err = silent_extractor_error(&exit(0, ""));
        assert_eq!(err.code(), "upstream_error");
        assert_eq!(err.to_string(), "extractor produced no output");
    }

    #[test]
    fn silent_failed_exit_is_classified() {
        let err = silent_extractor_error(&exit(1, "ERROR: Unsupported URL: x\n"));
        assert_eq!(err.code(), "unsupported_url");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
