//! Application-wide error types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured failure category shared by the pipeline, the store and the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedSource,
    PrivateContent,
    ContentUnavailable,
    UpstreamTimeout,
    UpstreamError,
    TranscodeError,
    Timeout,
    ClientCancelled,
    InvalidRequest,
    ArtifactNotFound,
    RangeNotSatisfiable,
    StoreIoError,
}

impl ErrorKind {
    /// Transport status reported for this kind of failure.
    pub fn status(self) -> StatusCode {
        match self {
            Self::UnsupportedSource | Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::PrivateContent => StatusCode::FORBIDDEN,
            Self::ContentUnavailable | Self::ArtifactNotFound => StatusCode::NOT_FOUND,
            Self::UpstreamTimeout | Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            // nginx's "client closed request"; never actually written to a peer.
            Self::ClientCancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::UpstreamError | Self::TranscodeError | Self::StoreIoError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable token for the failure envelope.
    pub fn code(self) -> &'static str {
        match self {
            Self::UnsupportedSource => "unsupported_url",
            Self::PrivateContent => "private_video",
            Self::ContentUnavailable => "video_unavailable",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamError => "upstream_error",
            Self::TranscodeError => "transcode_error",
            Self::Timeout => "timeout",
            Self::ClientCancelled => "client_cancelled",
            Self::InvalidRequest => "invalid_request",
            Self::ArtifactNotFound => "artifact_not_found",
            Self::RangeNotSatisfiable => "range_not_satisfiable",
            Self::StoreIoError => "store_io_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Extractor failure, already classified from its diagnostic text.
    #[error("{message}")]
    Upstream { kind: ErrorKind, message: String },

    #[error("{tool} not found. Please ensure {tool} is installed and in your PATH.")]
    ToolNotFound { tool: String },

    #[error("Failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcode failed: {0}")]
    Transcode(String),

    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Client disconnected")]
    ClientCancelled,

    #[error("url is required")]
    MissingUrl,

    #[error("invalid format '{0}', expected one of: mp3, m4a")]
    InvalidFormat(String),

    #[error("invalid proxy '{0}'")]
    InvalidProxy(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Requested range not satisfiable for {size} byte artifact")]
    RangeNotSatisfiable { size: u64 },

    #[error("IO error while {op} {}: {source}", .path.display())]
    StoreIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn upstream(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Upstream {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Attach operation and path context to a store IO failure.
    pub fn store_io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::StoreIo {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Map a spawn failure, distinguishing a missing binary.
    pub fn spawn(tool: impl Into<String>, source: std::io::Error) -> Self {
        let tool = tool.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::ToolNotFound { tool }
        } else {
            Self::Spawn { tool, source }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Upstream { kind, .. } => *kind,
            Self::ToolNotFound { .. } | Self::Spawn { .. } => ErrorKind::UpstreamError,
            Self::Transcode(_) => ErrorKind::TranscodeError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ClientCancelled => ErrorKind::ClientCancelled,
            Self::MissingUrl
            | Self::InvalidFormat(_)
            | Self::InvalidProxy(_)
            | Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            Self::RangeNotSatisfiable { .. } => ErrorKind::RangeNotSatisfiable,
            Self::StoreIo { .. } | Self::Io(_) => ErrorKind::StoreIoError,
            Self::Serialization(_) | Self::Configuration(_) | Self::Other(_) => {
                ErrorKind::UpstreamError
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    /// Envelope token; request validation errors are more specific than their kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingUrl => "missing_url",
            Self::InvalidFormat(_) => "invalid_format",
            Self::InvalidProxy(_) => "invalid_proxy",
            Self::ToolNotFound { .. } => "tool_not_found",
            other => other.kind().code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_have_specific_codes() {
        assert_eq!(Error::MissingUrl.code(), "missing_url");
        assert_eq!(Error::MissingUrl.status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::InvalidFormat("wav".into()).code(), "invalid_format");
        assert_eq!(Error::invalid_request("bad flag").code(), "invalid_request");
    }

    #[test]
    fn missing_binary_is_reported_as_tool_not_found() {
        let err = Error::spawn(
            "yt-dlp",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        assert!(matches!(err, Error::ToolNotFound { .. }));
        assert_eq!(err.code(), "tool_not_found");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("yt-dlp not found"));
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = Error::Timeout(Duration::from_millis(100));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code(), "timeout");
        assert_eq!(err.to_string(), "Operation timed out after 100ms");
    }

    #[test]
    fn client_cancelled_status_is_499() {
        assert_eq!(ErrorKind::ClientCancelled.status().as_u16(), 499);
    }
}
