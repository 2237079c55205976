//! Pipeline inputs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::Error;

/// Target audio encoding produced by the transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    M4a,
}

impl AudioFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::M4a => "audio/mp4",
        }
    }

    /// Parse an optional user-supplied format; absent or blank means mp3.
    pub fn parse_optional(value: Option<&str>) -> Result<Self, Error> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(v) => v.parse(),
        }
    }
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "m4a" => Ok(Self::M4a),
            _ => Err(Error::InvalidFormat(s.to_string())),
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Input to one orchestration run. Immutable once built.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    source: String,
    format: AudioFormat,
    proxy: Option<String>,
    deadline: Instant,
    extract_audio: bool,
}

impl PipelineRequest {
    /// Create a request whose deadline is `timeout` from now.
    pub fn new(source: impl Into<String>, format: AudioFormat, timeout: Duration) -> Self {
        Self {
            source: source.into(),
            format,
            proxy: None,
            deadline: Instant::now() + timeout,
            extract_audio: true,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Staged delivery only: keep the extractor's media as-is instead of
    /// transcoding it.
    pub fn with_extract_audio(mut self, extract_audio: bool) -> Self {
        self.extract_audio = extract_audio;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn extract_audio(&self) -> bool {
        self.extract_audio
    }
}
