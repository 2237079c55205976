//! Staged artifact store.
//!
//! Completed staged outputs live as `<uuid>.<ext>` files in a single
//! directory, indexed in memory. A record exists exactly when its file does:
//! files are written under a `.part` name and renamed into place before the
//! record is inserted, and records whose file has vanished are dropped on
//! lookup.

pub mod range;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use range::{ByteRange, RangeRequest, parse_range};

use crate::error::{Error, Result};

/// Default retention window for staged artifacts.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

const PART_SUFFIX: &str = ".part";
const READ_CHUNK: usize = 64 * 1024;

/// A completed staged output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedArtifact {
    pub id: String,
    pub path: PathBuf,
    pub content_type: String,
    pub extension: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl StagedArtifact {
    /// Name offered to clients downloading the artifact.
    pub fn download_name(&self) -> String {
        let stem = if self.content_type.starts_with("audio/") {
            "audio"
        } else {
            "video"
        };
        format!("{stem}.{}", self.extension)
    }
}

/// Content type for a stored file extension.
pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// A reserved, not yet committed artifact file.
///
/// The partial file is removed when this is dropped without being committed.
#[derive(Debug)]
pub struct PendingArtifact {
    id: String,
    extension: String,
    part_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl PendingArtifact {
    /// Where the producer should write.
    pub fn path(&self) -> &Path {
        &self.part_path
    }
}

impl Drop for PendingArtifact {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.part_path) {
            Ok(()) => debug!(path = %self.part_path.display(), "Removed abandoned partial artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.part_path.display(), "Failed to remove partial artifact: {}", e),
        }
    }
}

/// Directory of staged artifacts with an in-memory index.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    retention: Duration,
    records: DashMap<String, StagedArtifact>,
}

impl ArtifactStore {
    /// Open (creating if needed) the store at `root`.
    ///
    /// Completed artifacts left by a previous process are indexed again;
    /// leftover partial files are deleted.
    pub async fn open(root: impl Into<PathBuf>, retention: Duration) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::store_io("creating", &root, e))?;

        let store = Self {
            root,
            retention,
            records: DashMap::new(),
        };

        let mut entries = tokio::fs::read_dir(&store.root)
            .await
            .map_err(|e| Error::store_io("listing", &store.root, e))?;
        let mut partials = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::store_io("listing", &store.root, e))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_partial_name(name) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), "Failed to remove stale partial artifact: {}", e);
                } else {
                    partials += 1;
                }
                continue;
            }
            let Some((id, extension)) = parse_artifact_name(name) else {
                continue;
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            store.records.insert(
                id.clone(),
                StagedArtifact {
                    id,
                    path: path.clone(),
                    content_type: content_type_for_extension(&extension).to_string(),
                    extension,
                    size: metadata.len(),
                    created_at,
                },
            );
        }

        info!(
            root = %store.root.display(),
            artifacts = store.records.len(),
            removed_partials = partials,
            retention_secs = retention.as_secs(),
            "Artifact store opened"
        );
        Ok(store)
    }

    /// Number of indexed artifacts.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Reserve a fresh artifact slot with the given extension.
    pub fn reserve(&self, extension: &str) -> PendingArtifact {
        let id = Uuid::new_v4().to_string();
        let final_path = self.root.join(format!("{id}.{extension}"));
        let part_path = self.root.join(format!("{id}.{extension}{PART_SUFFIX}"));
        PendingArtifact {
            id,
            extension: extension.to_string(),
            part_path,
            final_path,
            committed: false,
        }
    }

    /// Move a fully written pending file into place and index it.
    pub async fn commit(
        &self,
        mut pending: PendingArtifact,
        content_type: &str,
    ) -> Result<StagedArtifact> {
        let metadata = tokio::fs::metadata(&pending.part_path)
            .await
            .map_err(|e| Error::store_io("inspecting", &pending.part_path, e))?;
        if metadata.len() == 0 {
            return Err(Error::store_io(
                "committing",
                &pending.part_path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "artifact is empty"),
            ));
        }

        tokio::fs::rename(&pending.part_path, &pending.final_path)
            .await
            .map_err(|e| Error::store_io("committing", &pending.final_path, e))?;
        pending.committed = true;

        let artifact = StagedArtifact {
            id: pending.id.clone(),
            path: pending.final_path.clone(),
            content_type: content_type.to_string(),
            extension: pending.extension.clone(),
            size: metadata.len(),
            created_at: Utc::now(),
        };
        self.records.insert(artifact.id.clone(), artifact.clone());
        info!(id = %artifact.id, size = artifact.size, content_type = %artifact.content_type, "Artifact stored");
        Ok(artifact)
    }

    /// Move an existing file into the store.
    pub async fn put(
        &self,
        source: &Path,
        extension: &str,
        content_type: &str,
    ) -> Result<StagedArtifact> {
        let pending = self.reserve(extension);
        if tokio::fs::rename(source, pending.path()).await.is_err() {
            // Source on another filesystem.
            tokio::fs::copy(source, pending.path())
                .await
                .map_err(|e| Error::store_io("copying", source, e))?;
            if let Err(e) = tokio::fs::remove_file(source).await {
                debug!(path = %source.display(), "Failed to remove moved source: {}", e);
            }
        }
        self.commit(pending, content_type).await
    }

    /// Look an artifact up by id.
    pub async fn get(&self, id: &str) -> Result<StagedArtifact> {
        let artifact = self
            .records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::ArtifactNotFound(id.to_string()))?;

        if tokio::fs::try_exists(&artifact.path).await.unwrap_or(false) {
            Ok(artifact)
        } else {
            warn!(id, path = %artifact.path.display(), "Artifact file vanished, dropping record");
            self.records.remove(id);
            Err(Error::ArtifactNotFound(id.to_string()))
        }
    }

    /// Evict an artifact. Returns whether it existed.
    ///
    /// The record is kept if the file cannot be deleted.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let Some(path) = self.records.get(id).map(|r| r.path.clone()) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::store_io("removing", &path, e)),
        }
        self.records.remove(id);
        info!(id, "Artifact evicted");
        Ok(true)
    }

    /// Synchronous eviction for drop paths.
    fn evict_now(&self, id: &str) {
        let Some(path) = self.records.get(id).map(|r| r.path.clone()) else {
            return;
        };
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(id, "Failed to evict artifact: {}", e);
            return;
        }
        self.records.remove(id);
        debug!(id, "Artifact evicted after delivery");
    }

    /// Delete everything older than the retention window.
    pub async fn sweep(&self) -> Result<Vec<String>> {
        self.sweep_older_than(self.retention).await
    }

    /// Delete every artifact and stale partial file whose modification time
    /// is more than `max_age` ago. Returns the ids of removed artifacts.
    pub async fn sweep_older_than(&self, max_age: Duration) -> Result<Vec<String>> {
        let now = SystemTime::now();
        let mut removed = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::store_io("listing", &self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::store_io("listing", &self.root, e))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            let artifact_id = parse_artifact_name(&name).map(|(id, _)| id);
            if artifact_id.is_none() && !is_partial_name(&name) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= max_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), "Failed to sweep file: {}", e);
                    continue;
                }
            }
            match artifact_id {
                Some(id) => {
                    self.records.remove(&id);
                    removed.push(id);
                }
                None => debug!(path = %path.display(), "Swept stale partial artifact"),
            }
        }

        // Records whose file was deleted behind our back.
        self.records.retain(|_, artifact| artifact.path.exists());

        if !removed.is_empty() {
            info!(count = removed.len(), "Swept expired artifacts");
        }
        Ok(removed)
    }

    /// Open `artifact` for reading, honoring an optional `Range` header.
    pub async fn read(&self, artifact: &StagedArtifact, range: Option<&str>) -> Result<ArtifactRead> {
        let size = artifact.size;
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Ok(value) = HeaderValue::from_str(&artifact.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        headers.insert(
            header::CONTENT_DISPOSITION,
            attachment_header(&artifact.download_name()),
        );

        let (status, start, len) = match parse_range(range, size) {
            RangeRequest::Full => (StatusCode::OK, 0, size),
            RangeRequest::Partial(r) => {
                headers.insert(header::CONTENT_RANGE, header_value(&r.content_range(size)));
                (StatusCode::PARTIAL_CONTENT, r.start, r.len())
            }
            RangeRequest::Unsatisfiable => {
                headers.insert(header::CONTENT_RANGE, header_value(&format!("bytes */{size}")));
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
                return Ok(ArtifactRead {
                    status: StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    body: None,
                });
            }
        };
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

        let mut file = tokio::fs::File::open(&artifact.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                self.records.remove(&artifact.id);
                Error::ArtifactNotFound(artifact.id.clone())
            } else {
                Error::store_io("opening", &artifact.path, e)
            }
        })?;
        if start > 0 {
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| Error::store_io("seeking", &artifact.path, e))?;
        }
        let body = ReaderStream::with_capacity(file.take(len), READ_CHUNK).boxed();

        debug!(id = %artifact.id, %status, start, len, "Serving artifact");
        Ok(ArtifactRead {
            status,
            headers,
            body: Some(body),
        })
    }
}

/// `Content-Disposition` value offering `filename` as a download.
pub fn attachment_header(filename: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Whether `name` is a `<uuid>.<ext>.part` file written by this store.
fn is_partial_name(name: &str) -> bool {
    name.strip_suffix(PART_SUFFIX)
        .and_then(parse_artifact_name)
        .is_some()
}

/// Split `<uuid>.<ext>` into id and extension.
fn parse_artifact_name(name: &str) -> Option<(String, String)> {
    let (id, extension) = name.split_once('.')?;
    if extension.is_empty() || extension.contains('.') {
        return None;
    }
    Uuid::parse_str(id).ok()?;
    Some((id.to_string(), extension.to_string()))
}

/// Response parts for an artifact read.
pub struct ArtifactRead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<BoxStream<'static, std::io::Result<Bytes>>>,
}

impl ArtifactRead {
    /// Evict the artifact from `store` once this body is done with, whether it
    /// was read to the end or abandoned.
    pub fn evict_after(mut self, store: Arc<ArtifactStore>, id: String) -> Self {
        let guard = EvictOnDrop { store, id };
        self.body = self.body.map(|body| {
            futures::stream::unfold((body, guard), |(mut body, guard)| async move {
                let chunk = body.next().await?;
                Some((chunk, (body, guard)))
            })
            .boxed()
        });
        self
    }
}

impl std::fmt::Debug for ArtifactRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRead")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl IntoResponse for ArtifactRead {
    fn into_response(self) -> Response {
        let body = match self.body {
            Some(stream) => Body::from_stream(stream),
            None => Body::empty(),
        };
        (self.status, self.headers, body).into_response()
    }
}

struct EvictOnDrop {
    store: Arc<ArtifactStore>,
    id: String,
}

impl Drop for EvictOnDrop {
    fn drop(&mut self) {
        self.store.evict_now(&self.id);
    }
}
