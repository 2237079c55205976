//! Relays remote media resolved by yt-dlp to HTTP clients, either as a live
//! ffmpeg-transcoded audio stream or as a staged file served with byte
//! ranges.

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod store;

pub use config::RelayConfig;
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{Pipeline, PipelineConfig, PipelineRequest};
pub use store::{ArtifactStore, StagedArtifact};
