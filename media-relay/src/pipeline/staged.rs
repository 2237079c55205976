//! Staged delivery: extractor to a scratch file, then transcoder into the
//! artifact store.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::command::{MediaSelection, MediaSink, TranscodeEndpoint, extractor_media_args, transcoder_args};
use super::process::{ProcessHandle, Stage, StageIo};
use super::request::PipelineRequest;
use super::run::{Outcome, PipelineRun};
use super::{Pipeline, extractor_error};
use crate::error::{Error, ErrorKind, Result};
use crate::store::{ArtifactStore, StagedArtifact, content_type_for_extension};

/// Stem of the extractor's output inside the run's scratch directory.
const SOURCE_STEM: &str = "source";

/// Extractor output template; the extension is filled in with the container
/// actually downloaded.
const SOURCE_TEMPLATE: &str = "source.%(ext)s";

impl Pipeline {
    /// Run a staged download and store the result.
    ///
    /// The transcoder only starts once the extractor has exited cleanly and
    /// left a non-empty file. With `extract_audio` off the extractor's file is
    /// stored as-is. Scratch space is removed on every exit path.
    pub async fn stage(
        &self,
        request: &PipelineRequest,
        store: &ArtifactStore,
    ) -> Result<StagedArtifact> {
        match store.sweep().await {
            Ok(removed) if !removed.is_empty() => {
                debug!(count = removed.len(), "Swept expired artifacts before staging");
            }
            Ok(_) => {}
            Err(e) => warn!("Artifact sweep failed: {}", e),
        }

        let run = PipelineRun::start(request.deadline());
        // Dropped with the handler future if the client goes away mid-run.
        let mut guard = run.cancel_on_drop();
        info!(
            run_id = %run.id(),
            source = %request.source(),
            format = %request.format(),
            extract_audio = request.extract_audio(),
            "Starting staged run"
        );

        let result = self.stage_in_scratch(&run, request, store).await;
        guard.disarm();
        match result {
            Ok(artifact) => {
                if run.terminate(Outcome::Success) {
                    Ok(artifact)
                } else {
                    // Deadline fired while the artifact was being committed.
                    if let Err(e) = store.remove(&artifact.id).await {
                        warn!(run_id = %run.id(), "Failed to discard late artifact: {}", e);
                    }
                    Err(run
                        .ended_error()
                        .unwrap_or_else(|| Error::Other("run ended without an outcome".into())))
                }
            }
            Err(e) => Err(run.fail(e)),
        }
    }

    async fn stage_in_scratch(
        &self,
        run: &PipelineRun,
        request: &PipelineRequest,
        store: &ArtifactStore,
    ) -> Result<StagedArtifact> {
        let scratch_root = &self.config.scratch_dir;
        tokio::fs::create_dir_all(scratch_root)
            .await
            .map_err(|e| Error::store_io("creating", scratch_root, e))?;
        let scratch = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(scratch_root)
            .map_err(|e| Error::store_io("creating scratch dir in", scratch_root, e))?;
        let template = scratch.path().join(SOURCE_TEMPLATE);

        let selection = if request.extract_audio() {
            MediaSelection::BestAudio
        } else {
            MediaSelection::BestVideo
        };
        let args = extractor_media_args(request, selection, MediaSink::File(&template));
        let extractor = ProcessHandle::spawn(
            Stage::Extractor,
            &self.config.extractor,
            &args,
            StageIo::NONE,
            run,
            self.config.diagnostic_limit,
        )?;

        let exit = extractor.wait().await;
        if let Some(err) = run.ended_error() {
            return Err(err);
        }
        if !exit.success() {
            return Err(extractor_error(&exit));
        }
        let Some(source) = find_source(scratch.path()).await else {
            return Err(Error::upstream(
                ErrorKind::UpstreamError,
                "extractor exited successfully but produced no file",
            ));
        };
        debug!(run_id = %run.id(), size = source.size, extension = %source.extension, "Extractor finished");

        if !request.extract_audio() {
            return store
                .put(
                    &source.path,
                    &source.extension,
                    content_type_for_extension(&source.extension),
                )
                .await;
        }

        let format = request.format();
        let pending = store.reserve(format.extension());
        let args = transcoder_args(
            format,
            TranscodeEndpoint::File(&source.path),
            TranscodeEndpoint::File(pending.path()),
        );
        let transcoder = ProcessHandle::spawn(
            Stage::Transcoder,
            &self.config.transcoder,
            &args,
            StageIo::NONE,
            run,
            self.config.diagnostic_limit,
        )?;

        let exit = transcoder.wait().await;
        if let Some(err) = run.ended_error() {
            return Err(err);
        }
        if !exit.success() {
            return Err(Error::Transcode(exit.describe(transcoder.tool())));
        }
        if file_size(pending.path()).await == 0 {
            return Err(Error::Transcode("transcoder produced no output".into()));
        }

        store.commit(pending, format.content_type()).await
    }
}

/// The file the extractor left in the scratch directory.
struct SourceFile {
    path: PathBuf,
    extension: String,
    size: u64,
}

/// Locate the extractor's non-empty `source.<ext>` output, ignoring partial
/// and bookkeeping files. The largest candidate wins.
async fn find_source(scratch: &Path) -> Option<SourceFile> {
    let mut entries = tokio::fs::read_dir(scratch).await.ok()?;
    let mut best: Option<SourceFile> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(extension) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(SOURCE_STEM))
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|ext| !ext.is_empty() && !ext.contains('.'))
            .filter(|ext| !matches!(*ext, "part" | "ytdl" | "temp"))
            .map(str::to_ascii_lowercase)
        else {
            continue;
        };
        let size = file_size(&path).await;
        if size > 0 && best.as_ref().is_none_or(|b| size > b.size) {
            best = Some(SourceFile {
                path,
                extension,
                size,
            });
        }
    }
    best
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::{AudioFormat, PipelineConfig, ToolCommand};
    use crate::store::DEFAULT_RETENTION;

    const EXTRACTOR: &str = r#"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
printf 'media-bytes' > "$(printf '%s' "$out" | sed "s/%(ext)s/${EXT:-mp4}/")"
"#;

    const TRANSCODER: &str = r#"
for a in "$@"; do last="$a"; done
while [ $# -gt 0 ]; do
  if [ "$1" = "-i" ]; then in="$2"; fi
  shift
done
cat "$in" > "$last"
"#;

    fn sh(script: &str, name: &str) -> ToolCommand {
        ToolCommand::new("sh").with_base_args(["-c", script, name])
    }

    fn pipeline(scratch: &Path, extractor: &str, transcoder: &str) -> Pipeline {
        Pipeline::new(PipelineConfig {
            extractor: sh(extractor, "yt-dlp"),
            transcoder: sh(transcoder, "ffmpeg"),
            scratch_dir: scratch.to_path_buf(),
            ..Default::default()
        })
    }

    fn request(timeout: Duration) -> PipelineRequest {
        PipelineRequest::new("https://valid", AudioFormat::Mp3, timeout)
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
    }

    #[tokio::test]
    async fn stages_transcoded_audio() {
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(artifacts.path(), DEFAULT_RETENTION).await.unwrap();
        let pipeline = pipeline(scratch.path(), EXTRACTOR, TRANSCODER);

        let artifact = pipeline
            .stage(&request(Duration::from_secs(10)), &store)
            .await
            .unwrap();
        assert_eq!(artifact.content_type, "audio/mpeg");
        assert_eq!(artifact.extension, "mp3");
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"media-bytes");
        assert!(is_empty_dir(scratch.path()));
    }

    #[tokio::test]
    async fn video_is_stored_without_transcoding() {
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(artifacts.path(), DEFAULT_RETENTION).await.unwrap();
        let pipeline = pipeline(scratch.path(), EXTRACTOR, "exit 9");

        let artifact = pipeline
            .stage(&request(Duration::from_secs(10)).with_extract_audio(false), &store)
            .await
            .unwrap();
        assert_eq!(artifact.content_type, "video/mp4");
        assert_eq!(artifact.download_name(), "video.mp4");
        assert!(is_empty_dir(scratch.path()));
    }

    #[tokio::test]
    async fn video_keeps_the_downloaded_container() {
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(artifacts.path(), DEFAULT_RETENTION).await.unwrap();
        let pipeline = pipeline(scratch.path(), &format!("EXT=webm; {EXTRACTOR}"), "exit 9");

        let artifact = pipeline
            .stage(&request(Duration::from_secs(10)).with_extract_audio(false), &store)
            .await
            .unwrap();
        assert_eq!(artifact.extension, "webm");
        assert_eq!(artifact.content_type, "video/webm");
        assert_eq!(artifact.download_name(), "video.webm");
        assert!(artifact.path.ends_with(format!("{}.webm", artifact.id)));
        assert!(is_empty_dir(scratch.path()));
    }

    #[tokio::test]
    async fn finds_the_source_among_bookkeeping_files() {
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(scratch.path().join("source.mkv"), b"video").unwrap();
        std::fs::write(scratch.path().join("source.mkv.part"), b"partial-bytes").unwrap();
        std::fs::write(scratch.path().join("source.ytdl"), b"{}").unwrap();
        std::fs::write(scratch.path().join("source.webm"), b"").unwrap();

        let source = find_source(scratch.path()).await.unwrap();
        assert_eq!(source.extension, "mkv");
        assert_eq!(source.size, 5);

        let empty = tempfile::tempdir().unwrap();
        assert!(find_source(empty.path()).await.is_none());
    }

    #[tokio::test]
    async fn extractor_failure_is_classified_and_skips_transcoding() {
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(artifacts.path(), DEFAULT_RETENTION).await.unwrap();
        let pipeline = pipeline(
            scratch.path(),
            "echo 'ERROR: Video unavailable' >&2; exit 1",
            TRANSCODER,
        );

        let err = pipeline
            .stage(&request(Duration::from_secs(10)), &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "video_unavailable");
        assert!(store.is_empty());
        assert!(is_empty_dir(scratch.path()));
    }

    #[tokio::test]
    async fn clean_exit_without_a_file_is_an_upstream_error() {
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(artifacts.path(), DEFAULT_RETENTION).await.unwrap();
        let pipeline = pipeline(scratch.path(), "exit 0", TRANSCODER);

        let err = pipeline
            .stage(&request(Duration::from_secs(10)), &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "upstream_error");
    }

    #[tokio::test]
    async fn transcoder_failure_leaves_no_partial_artifact() {
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(artifacts.path(), DEFAULT_RETENTION).await.unwrap();
        let pipeline = pipeline(
            scratch.path(),
            EXTRACTOR,
            "echo 'Invalid data found when processing input' >&2; exit 1",
        );

        let err = pipeline
            .stage(&request(Duration::from_secs(10)), &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transcode_error");
        assert!(err.to_string().contains("Invalid data found"));
        assert!(is_empty_dir(artifacts.path()));
        assert!(is_empty_dir(scratch.path()));
    }

    #[tokio::test]
    async fn deadline_kills_a_hung_extractor() {
        let scratch = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(artifacts.path(), DEFAULT_RETENTION).await.unwrap();
        let pipeline = pipeline(scratch.path(), "exec sleep 30", TRANSCODER);

        let started = std::time::Instant::now();
        let err = pipeline
            .stage(&request(Duration::from_millis(200)), &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(is_empty_dir(scratch.path()));
    }
}
