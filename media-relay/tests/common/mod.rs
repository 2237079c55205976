//! Shared fixtures: fake extractor/transcoder tools written as `sh` scripts
//! and a router wired to temporary directories.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use tempfile::TempDir;
use tower::ServiceExt;

use media_relay::api::{ApiServer, ApiServerConfig, AppState};
use media_relay::pipeline::ToolCommand;
use media_relay::{ArtifactStore, Pipeline, PipelineConfig};

/// Extractor that writes `media-bytes` to wherever `-o` points (`-` is
/// stdout), filling in an `mp4` extension for `%(ext)s`.
pub const EXTRACTOR_OK: &str = r#"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
if [ "$out" = "-" ]; then
  printf 'media-bytes'
else
  printf 'media-bytes' > "$(printf '%s' "$out" | sed 's/%(ext)s/mp4/')"
fi
"#;

/// Transcoder that copies its input to its output unchanged.
pub const TRANSCODER_COPY: &str = r#"
for a in "$@"; do last="$a"; done
in=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-i" ]; then in="$2"; fi
  shift
done
if [ "$in" = "pipe:0" ]; then exec cat; else cat "$in" > "$last"; fi
"#;

/// `sh -c <script> <name>`.
pub fn tool(script: &str, name: &str) -> ToolCommand {
    ToolCommand::new("sh").with_base_args(["-c", script, name])
}

/// Script fragment recording the shell's pid under `dir/<name>.pid`.
pub fn record_pid(dir: &Path, name: &str) -> String {
    format!("echo $$ > '{}'; ", dir.join(format!("{name}.pid")).display())
}

/// Temporary directories and the service built on them.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<ArtifactStore>,
    pub scratch: TempDir,
    pub artifacts: TempDir,
    /// Free directory for pid files and markers.
    pub marks: TempDir,
}

impl TestApp {
    pub async fn new(extractor: &str, transcoder: &str) -> Self {
        let (extractor, transcoder) = (extractor.to_string(), transcoder.to_string());
        Self::build(Duration::from_secs(10), move |_| (extractor, transcoder)).await
    }

    /// Build with scripts that may refer to the marks directory.
    pub async fn build<F>(timeout: Duration, scripts: F) -> Self
    where
        F: FnOnce(&Path) -> (String, String),
    {
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let marks = tempfile::tempdir().unwrap();
        let (extractor, transcoder) = scripts(marks.path());

        let pipeline = Pipeline::new(PipelineConfig {
            extractor: tool(&extractor, "yt-dlp"),
            transcoder: tool(&transcoder, "ffmpeg"),
            timeout,
            scratch_dir: scratch.path().to_path_buf(),
            ..Default::default()
        });
        let store = Arc::new(
            ArtifactStore::open(artifacts.path(), Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let state = AppState::new(pipeline, store.clone());
        let router = ApiServer::new(ApiServerConfig::default(), state).build_router();

        Self {
            router,
            store,
            scratch,
            artifacts,
            marks,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        self.send(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub fn mark(&self, name: &str) -> PathBuf {
        self.marks.path().join(name)
    }

    pub fn scratch_is_empty(&self) -> bool {
        is_empty_dir(self.scratch.path())
    }
}

pub fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut d| d.next().is_none())
        .unwrap_or(true)
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Whether the process with the pid recorded in `pid_file` is still alive.
pub fn is_alive(pid_file: &Path) -> bool {
    let pid = std::fs::read_to_string(pid_file).unwrap();
    std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Wait until `path` exists and is non-empty.
pub async fn wait_for_file(path: &Path) {
    for _ in 0..200 {
        if std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} never appeared", path.display());
}

/// Wait until the process recorded in `pid_file` is gone.
pub async fn wait_until_dead(pid_file: &Path) {
    for _ in 0..200 {
        if !is_alive(pid_file) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("process from {} is still alive", pid_file.display());
}
