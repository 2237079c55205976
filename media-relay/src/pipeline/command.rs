//! Command lines for the external extractor (yt-dlp) and transcoder (ffmpeg).

use std::path::Path;

use super::request::{AudioFormat, PipelineRequest};

/// An external tool: its program and arguments that always come first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    base_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// Arguments placed before the pipeline's own (wrappers such as `sh -c`).
    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub(crate) fn command(&self) -> tokio::process::Command {
        process_utils::tokio_command(&self.program, &self.base_args)
    }
}

/// Where the extractor writes media.
#[derive(Debug, Clone, Copy)]
pub enum MediaSink<'a> {
    Stdout,
    /// An output template; may contain yt-dlp fields such as `%(ext)s`.
    File(&'a Path),
}

/// Which media the extractor selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSelection {
    BestAudio,
    BestVideo,
}

impl MediaSelection {
    fn selector(self) -> &'static str {
        match self {
            Self::BestAudio => "bestaudio/best",
            Self::BestVideo => "best[ext=mp4]/best",
        }
    }
}

fn push_proxy_and_source(args: &mut Vec<String>, proxy: Option<&str>, source: &str) {
    if let Some(proxy) = proxy {
        args.extend(["--proxy".to_string(), proxy.to_string()]);
    }
    // Keep a source beginning with '-' from being read as an option.
    args.push("--".to_string());
    args.push(source.to_string());
}

/// Build extractor arguments for fetching media bytes.
pub fn extractor_media_args(
    request: &PipelineRequest,
    selection: MediaSelection,
    sink: MediaSink<'_>,
) -> Vec<String> {
    let mut args = vec!["-f".to_string(), selection.selector().to_string()];
    match sink {
        MediaSink::Stdout => args.extend(["-o".to_string(), "-".to_string()]),
        MediaSink::File(path) => args.extend([
            "--no-part".to_string(),
            "-o".to_string(),
            path.to_string_lossy().into_owned(),
        ]),
    }
    push_proxy_and_source(&mut args, request.proxy(), request.source());
    args
}

/// Build extractor arguments for a metadata dump.
pub fn extractor_probe_args(source: &str, proxy: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = [
        "--dump-json",
        "--skip-download",
        "--no-warnings",
        "--format",
        "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    push_proxy_and_source(&mut args, proxy, source);
    args
}

/// Transcoder input or output location.
#[derive(Debug, Clone, Copy)]
pub enum TranscodeEndpoint<'a> {
    Pipe,
    File(&'a Path),
}

/// Build transcoder arguments for re-encoding to `format`.
pub fn transcoder_args(
    format: AudioFormat,
    input: TranscodeEndpoint<'_>,
    output: TranscodeEndpoint<'_>,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if matches!(output, TranscodeEndpoint::File(_)) {
        args.push("-y".into());
    }

    args.push("-i".into());
    args.push(match input {
        TranscodeEndpoint::Pipe => "pipe:0".into(),
        TranscodeEndpoint::File(path) => path.to_string_lossy().into_owned(),
    });

    let (codec, muxer) = match format {
        AudioFormat::Mp3 => ("libmp3lame", "mp3"),
        AudioFormat::M4a => ("aac", "ipod"),
    };
    args.extend(
        ["-vn", "-acodec", codec, "-b:a", "192k", "-f", muxer]
            .into_iter()
            .map(String::from),
    );

    args.push(match output {
        TranscodeEndpoint::Pipe => "pipe:1".into(),
        TranscodeEndpoint::File(path) => path.to_string_lossy().into_owned(),
    });
    args
}
