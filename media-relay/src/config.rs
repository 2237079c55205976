//! Service configuration from the environment.
//!
//! Everything is optional. Values that do not parse are logged and replaced
//! by their default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::api::ApiServerConfig;
use crate::logging::LogFormat;
use crate::pipeline::{PipelineConfig, ToolCommand};
use crate::store::DEFAULT_RETENTION;

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server: ApiServerConfig,
    pub pipeline: PipelineConfig,
    /// Directory holding staged artifacts.
    pub artifact_dir: PathBuf,
    pub artifact_retention: Duration,
    pub log_format: LogFormat,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ApiServerConfig::default(),
            pipeline: PipelineConfig::default(),
            artifact_dir: default_data_dir().join("artifacts"),
            artifact_retention: DEFAULT_RETENTION,
            log_format: LogFormat::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::temp_dir().join("media-relay")
}

impl RelayConfig {
    /// Read the configuration from process environment variables.
    ///
    /// Problems are reported through `tracing`, so install the subscriber
    /// first (see [`RelayConfig::log_format_from_env`]).
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Output format requested through `LOG_FORMAT`, read on its own so that
    /// logging can be set up before the rest of the configuration.
    pub fn log_format_from_env() -> LogFormat {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or_default()
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(bind_address) = var("API_BIND_ADDRESS") {
            config.server.bind_address = bind_address;
        }
        if let Some(port) = parsed::<u16>("API_PORT", var("API_PORT")) {
            config.server.port = port;
        }

        config.pipeline.proxy = var("PROXY_URL")
            .or_else(|| var("HTTP_PROXY"))
            .or_else(|| var("HTTPS_PROXY"));
        if let Some(ms) = parsed::<u64>("CONVERT_TIMEOUT_MS", var("CONVERT_TIMEOUT_MS")) {
            config.pipeline.timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = parsed::<usize>("DIAGNOSTIC_LIMIT_BYTES", var("DIAGNOSTIC_LIMIT_BYTES"))
        {
            config.pipeline.diagnostic_limit = limit;
        }
        if let Some(path) = var("YTDLP_PATH") {
            config.pipeline.extractor = ToolCommand::new(path);
        }
        if let Some(path) = var("FFMPEG_PATH") {
            config.pipeline.transcoder = ToolCommand::new(path);
        }
        if let Some(dir) = var("SCRATCH_DIR") {
            config.pipeline.scratch_dir = PathBuf::from(dir);
        }

        if let Some(dir) = var("ARTIFACT_DIR") {
            config.artifact_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parsed::<u64>("ARTIFACT_RETENTION_SECS", var("ARTIFACT_RETENTION_SECS"))
        {
            config.artifact_retention = Duration::from_secs(secs);
        }

        if let Some(format) = var("LOG_FORMAT") {
            config.log_format = LogFormat::parse(&format).unwrap_or_else(|| {
                warn!(value = %format, "Unknown LOG_FORMAT, using pretty output");
                LogFormat::Pretty
            });
        }

        config
    }
}

fn parsed<T: FromStr>(key: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "Ignoring unparseable configuration value");
            None
        }
    }
}
