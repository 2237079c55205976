//! Logging setup.
//!
//! A registry with an `EnvFilter` (from `RUST_LOG`, or [`DEFAULT_LOG_FILTER`])
//! and one fmt layer writing through a non-blocking stdout appender, either
//! human readable or JSON.

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "media_relay=info,tower_http=info";

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse a `LOG_FORMAT` value; `text` is an alias of `pretty`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process; dropping it
/// flushes and stops the background writer.
pub fn init_logging(format: LogFormat) -> Result<WorkerGuard> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let pretty = (format == LogFormat::Pretty).then(|| {
        fmt::layer()
            .with_writer(writer.clone())
            .with_ansi(true)
            .with_timer(LocalTimer)
    });
    let json = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(LocalTimer)
            .with_current_span(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}
