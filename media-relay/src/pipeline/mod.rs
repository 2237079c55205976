//! Process-pipeline orchestrator.
//!
//! Chains the extractor and the transcoder into one logical operation and
//! exposes it in three shapes:
//!
//! - [`Pipeline::stream`]: both processes joined by a pipe, output streamed live
//! - [`Pipeline::stage`]: extractor to a scratch file, then transcoder into the
//!   [`ArtifactStore`](crate::store::ArtifactStore)
//! - [`Pipeline::probe`]: extractor only, structured metadata output
//!
//! Every shape creates a [`PipelineRun`] which owns the spawned processes,
//! the deadline and the final [`Outcome`].

pub mod classify;
pub mod command;
pub mod probe;
pub mod process;
pub mod request;
pub mod run;
pub mod staged;
pub mod streaming;

use std::path::PathBuf;
use std::time::Duration;

pub use classify::{Classification, classify};
pub use command::ToolCommand;
pub use probe::{FormatSummary, MediaSummary, curate};
pub use process::{ExitState, ProcessHandle, Stage};
pub use request::{AudioFormat, PipelineRequest};
pub use run::{CancelOnDrop, Outcome, PipelineRun};
pub use streaming::AudioStream;

use crate::error::{Error, Result};

/// Default overall operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(90_000);

/// Default bound on retained diagnostic text per process.
pub const DEFAULT_DIAGNOSTIC_LIMIT: usize = 64 * 1024;

/// Settings every run is constructed from.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Extractor tool (yt-dlp).
    pub extractor: ToolCommand,
    /// Transcoder tool (ffmpeg).
    pub transcoder: ToolCommand,
    /// Window between request arrival and forced termination.
    pub timeout: Duration,
    /// Proxy used when a request does not carry its own.
    pub proxy: Option<String>,
    /// Max stderr bytes kept per process.
    pub diagnostic_limit: usize,
    /// Parent directory of per-run scratch directories.
    pub scratch_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extractor: ToolCommand::new("yt-dlp"),
            transcoder: ToolCommand::new("ffmpeg"),
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
            diagnostic_limit: DEFAULT_DIAGNOSTIC_LIMIT,
            scratch_dir: std::env::temp_dir().join("media-relay").join("scratch"),
        }
    }
}

/// Entry point for all pipeline runs.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Validate user input and build a request with this pipeline's
    /// deadline and proxy defaults.
    pub fn request(
        &self,
        source: Option<&str>,
        format: Option<&str>,
        proxy: Option<&str>,
    ) -> Result<PipelineRequest> {
        let source = source
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingUrl)?;
        let format = AudioFormat::parse_optional(format)?;
        let proxy = match proxy.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => Some(validate_proxy(p)?),
            None => self.config.proxy.clone(),
        };

        Ok(PipelineRequest::new(source, format, self.config.timeout).with_proxy(proxy))
    }
}

fn validate_proxy(proxy: &str) -> Result<String> {
    let parsed = url::Url::parse(proxy).map_err(|_| Error::InvalidProxy(proxy.to_string()))?;
    match parsed.scheme() {
        "http" | "https" | "socks4" | "socks4a" | "socks5" | "socks5h" => Ok(proxy.to_string()),
        _ => Err(Error::InvalidProxy(proxy.to_string())),
    }
}

/// Error for an extractor that did not exit cleanly.
pub(crate) fn extractor_error(exit: &ExitState) -> Error {
    let classification = classify(&exit.diagnostics);
    Error::upstream(
        classification.kind,
        classify::failure_message(&exit.diagnostics),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(proxy: Option<&str>) -> Pipeline {
        Pipeline::new(PipelineConfig {
            proxy: proxy.map(String::from),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn request_validation_happens_before_anything_runs() {
        let p = pipeline(None);
        assert!(matches!(p.request(None, None, None), Err(Error::MissingUrl)));
        assert!(matches!(p.request(Some("  "), None, None), Err(Error::MissingUrl)));
        assert!(matches!(
            p.request(Some("https://valid"), Some("wav"), None),
            Err(Error::InvalidFormat(_))
        ));
        assert!(matches!(
            p.request(Some("https://valid"), None, Some("not a proxy")),
            Err(Error::InvalidProxy(_))
        ));
    }

    #[tokio::test]
    async fn request_proxy_overrides_the_configured_one() {
        let p = pipeline(Some("http://default:3128"));
        let req = p.request(Some("https://valid"), Some("m4a"), None).unwrap();
        assert_eq!(req.proxy(), Some("http://default:3128"));
        assert_eq!(req.format(), AudioFormat::M4a);

        let req = p
            .request(Some("https://valid"), None, Some("socks5://10.0.0.1:1080"))
            .unwrap();
        assert_eq!(req.proxy(), Some("socks5://10.0.0.1:1080"));
    }

    #[test]
    fn extractor_errors_are_classified() {
        let exit = ExitState {
            code: Some(1),
            killed: false,
            diagnostics: "ERROR: Private video\n".into(),
        };
        let err = extractor_error(&exit);
        assert_eq!(err.code(), "private_video");
        assert_eq!(err.to_string(), "ERROR: Private video");
    }
}
