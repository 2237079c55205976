//! Metadata probe: the extractor alone, in JSON dump mode.

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::command::extractor_probe_args;
use super::process::{ProcessHandle, Stage, StageIo};
use super::request::PipelineRequest;
use super::run::{Outcome, PipelineRun};
use super::{Pipeline, extractor_error};
use crate::error::{Error, ErrorKind, Result};

/// Largest metadata document accepted from the extractor.
pub const MAX_METADATA_BYTES: u64 = 32 * 1024 * 1024;

/// Curated view of an extractor metadata record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaSummary {
    pub id: Option<String>,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub author: Option<String>,
    pub thumbnail: Option<String>,
    pub webpage_url: Option<String>,
    pub format: Option<FormatSummary>,
}

/// The playable format picked for a [`MediaSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatSummary {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub url: String,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
    pub abr: Option<f64>,
    pub tbr: Option<f64>,
    pub filesize: Option<u64>,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn format_summary(format: &Value, url: String) -> FormatSummary {
    FormatSummary {
        format_id: str_field(format, "format_id"),
        ext: str_field(format, "ext"),
        url,
        acodec: str_field(format, "acodec"),
        vcodec: str_field(format, "vcodec"),
        abr: format.get("abr").and_then(Value::as_f64),
        tbr: format.get("tbr").and_then(Value::as_f64),
        filesize: format
            .get("filesize")
            .or_else(|| format.get("filesize_approx"))
            .and_then(Value::as_u64),
    }
}

/// Project a raw metadata record onto the fields clients care about.
///
/// `formats` is ordered worst to best, so the last entry with a URL and an
/// audio track wins. Without one the record's own `url` is used.
pub fn curate(record: &Value) -> MediaSummary {
    let best = record
        .get("formats")
        .and_then(Value::as_array)
        .and_then(|formats| {
            formats.iter().rev().find_map(|f| {
                let url = str_field(f, "url")?;
                match f.get("acodec").and_then(Value::as_str) {
                    Some("none") | None => None,
                    Some(_) => Some(format_summary(f, url)),
                }
            })
        })
        .or_else(|| str_field(record, "url").map(|url| format_summary(record, url)));

    MediaSummary {
        id: str_field(record, "id"),
        title: str_field(record, "title"),
        duration: record.get("duration").and_then(Value::as_f64),
        author: str_field(record, "uploader")
            .or_else(|| str_field(record, "channel"))
            .or_else(|| str_field(record, "creator")),
        thumbnail: str_field(record, "thumbnail"),
        webpage_url: str_field(record, "webpage_url"),
        format: best,
    }
}

impl Pipeline {
    /// Fetch the extractor's metadata record for `request`'s source.
    pub async fn probe(&self, request: &PipelineRequest) -> Result<Value> {
        let run = PipelineRun::start(request.deadline());
        let mut guard = run.cancel_on_drop();
        info!(run_id = %run.id(), source = %request.source(), "Probing metadata");

        let result = self.probe_run(&run, request).await;
        guard.disarm();
        match result {
            Ok(record) if run.terminate(Outcome::Success) => Ok(record),
            Ok(_) => Err(run
                .ended_error()
                .unwrap_or_else(|| Error::Other("run ended without an outcome".into()))),
            Err(e) => Err(run.fail(e)),
        }
    }

    async fn probe_run(&self, run: &PipelineRun, request: &PipelineRequest) -> Result<Value> {
        let args = extractor_probe_args(request.source(), request.proxy());
        let mut extractor = ProcessHandle::spawn(
            Stage::Extractor,
            &self.config.extractor,
            &args,
            StageIo::STDOUT,
            run,
            self.config.diagnostic_limit,
        )?;
        let mut stdout = extractor.take_stdout()?.take(MAX_METADATA_BYTES + 1);

        let mut output = Vec::new();
        let token = run.token();
        let read = tokio::select! {
            biased;
            r = stdout.read_to_end(&mut output) => Some(r),
            _ = token.cancelled() => None,
        };
        match read {
            Some(Ok(_)) if output.len() as u64 > MAX_METADATA_BYTES => {
                return Err(Error::upstream(
                    ErrorKind::UpstreamError,
                    format!("metadata exceeds {MAX_METADATA_BYTES} bytes"),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(Error::upstream(
                    ErrorKind::UpstreamError,
                    format!("reading extractor output: {e}"),
                ));
            }
            None => {}
        }

        let exit = extractor.wait().await;
        if let Some(err) = run.ended_error() {
            return Err(err);
        }
        if !exit.success() {
            return Err(extractor_error(&exit));
        }
        debug!(run_id = %run.id(), bytes = output.len(), "Extractor metadata received");

        serde_json::from_slice(&output).map_err(|e| {
            Error::upstream(
                ErrorKind::UpstreamError,
                format!("Failed to parse yt-dlp output: {e}"),
            )
        })
    }
}
