//! Local filesystem blob store backend.
//!
//! Blobs live at `<root>/<namespace>/<hash[0:2]>/<hash[2:4]>/<hash>`. The
//! modification time of a blob file is its last-access time: it is reset to
//! the epoch on write and bumped to now on tracked reads, and
//! [`FileSystemStore::cleanup`] evicts the oldest files first.

use std::{
    collections::BinaryHeap,
    io,
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_model::{BlobError, BlobId, BlobResult, LastAccessTracking, NamespaceId};
use filetime::FileTime;
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{BackendInfo, BackendKind, BlobContents, BlobMetadata, BlobStore, ListedBlob};

const TMP_DIR: &str = "~tmp";

fn default_max_size_bytes() -> u64 {
    100 * 1024 * 1024 * 1024
}

fn default_trigger_threshold() -> f64 {
    0.95
}

fn default_target_threshold() -> f64 {
    0.7
}

fn default_max_files_per_pass() -> usize {
    100_000
}

fn default_max_passes() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSystemConfig {
    pub root: PathBuf,

    /// Disk budget the eviction thresholds are fractions of.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// Cleanup does nothing while usage is at or below this fraction.
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,

    /// Cleanup evicts until usage is at or below this fraction.
    #[serde(default = "default_target_threshold")]
    pub target_threshold: f64,

    #[serde(default = "default_max_files_per_pass")]
    pub max_files_per_pass: usize,

    #[serde(default = "default_max_passes")]
    pub max_passes: usize,
}

impl FileSystemConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_size_bytes: default_max_size_bytes(),
            trigger_threshold: default_trigger_threshold(),
            target_threshold: default_target_threshold(),
            max_files_per_pass: default_max_files_per_pass(),
            max_passes: default_max_passes(),
        }
    }
}

/// Outcome of one [`FileSystemStore::cleanup`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub files_deleted: u64,
    pub passes: usize,
}

pub struct FileSystemStore {
    config: FileSystemConfig,
}

impl FileSystemStore {
    pub async fn new(config: FileSystemConfig) -> BlobResult<Self> {
        tokio::fs::create_dir_all(config.root.join(TMP_DIR)).await?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FileSystemConfig {
        &self.config
    }

    fn namespace_dir(&self, ns: &NamespaceId) -> PathBuf {
        self.config.root.join(ns.as_str())
    }

    fn blob_path(&self, ns: &NamespaceId, blob: &BlobId) -> PathBuf {
        let hex = blob.to_hex();
        self.namespace_dir(ns)
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }

    async fn not_found(&self, ns: &NamespaceId, blob: &BlobId) -> BlobError {
        match tokio::fs::try_exists(self.namespace_dir(ns)).await {
            Ok(true) => BlobError::blob_not_found(ns, blob),
            _ => BlobError::namespace_not_found(ns),
        }
    }

    /// Evict least recently accessed blobs until usage is at or below the
    /// target threshold. A no-op while usage is at or below the trigger
    /// threshold.
    pub async fn cleanup(&self) -> BlobResult<GcReport> {
        let config = self.config.clone();
        let report = tokio::task::spawn_blocking(move || collect_garbage(&config))
            .await
            .map_err(|e| BlobError::Other { source: e.into() })??;
        if report.files_deleted > 0 {
            info!(
                root = %self.config.root.display(),
                bytes_before = report.bytes_before,
                bytes_after = report.bytes_after,
                files_deleted = report.files_deleted,
                passes = report.passes,
                "filesystem cleanup evicted blobs"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl BlobStore for FileSystemStore {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::FileSystem,
            root_capable: true,
            supports_consistency_scan: true,
            local: true,
        }
    }

    async fn put(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) -> BlobResult<BlobId> {
        if content.is_empty() {
            warn!(namespace = %ns, blob = %blob, "writing zero-length blob to filesystem");
        }
        let path = self.blob_path(ns, blob);
        if tokio::fs::try_exists(&path).await? {
            return Ok(*blob);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self
            .config
            .root
            .join(TMP_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&tmp, &content).await?;

        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&tmp).await?;
            return Ok(*blob);
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        filetime::set_file_mtime(&path, FileTime::zero())?;
        debug!(namespace = %ns, blob = %blob, path = %path.display(), "stored blob");
        Ok(*blob)
    }

    async fn get(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        tracking: LastAccessTracking,
        _supports_redirect: bool,
    ) -> BlobResult<BlobContents> {
        let path = self.blob_path(ns, blob);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.not_found(ns, blob).await)
            }
            Err(e) => return Err(e.into()),
        };
        let length = file.metadata().await?.len();
        if tracking == LastAccessTracking::Track {
            filetime::set_file_mtime(&path, FileTime::now())?;
        }
        let stream = ReaderStream::new(file).map(|chunk| chunk.map_err(BlobError::from));
        Ok(BlobContents::from_stream(stream.boxed(), length))
    }

    async fn exists(&self, ns: &NamespaceId, blob: &BlobId, _force_check: bool) -> BlobResult<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(ns, blob)).await?)
    }

    async fn metadata(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<BlobMetadata> {
        let meta = match tokio::fs::metadata(self.blob_path(ns, blob)).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.not_found(ns, blob).await)
            }
            Err(e) => return Err(e.into()),
        };
        let created = meta.created().or_else(|_| meta.modified())?;
        Ok(BlobMetadata {
            size_bytes: meta.len(),
            created_at: DateTime::<Utc>::from(created),
        })
    }

    async fn delete(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<bool> {
        match tokio::fs::remove_file(self.blob_path(ns, blob)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, ns: &NamespaceId) -> BlobResult<()> {
        match tokio::fs::remove_dir_all(self.namespace_dir(ns)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Walks the fan-out directories in sorted order, pruning those that
    /// sort before `start_after`.
    fn list(
        &self,
        ns: &NamespaceId,
        start_after: Option<BlobId>,
    ) -> BoxStream<'static, BlobResult<ListedBlob>> {
        let dir = self.namespace_dir(ns);
        let cursor = start_after.map(|blob| blob.to_hex());
        let stream = try_stream! {
            // (directory, concatenated fan-out prefix)
            let mut pending = Vec::new();
            if tokio::fs::try_exists(&dir).await? {
                pending.push((dir, String::new()));
            }
            while let Some((dir, prefix)) = pending.pop() {
                let mut entries = tokio::fs::read_dir(&dir).await?;
                let mut dirs = Vec::new();
                let mut files = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                        continue;
                    };
                    if entry.file_type().await?.is_dir() {
                        let child = format!("{}{}", prefix, name);
                        let before_cursor = cursor.as_deref().is_some_and(|cursor| {
                            child.as_str() < &cursor[..child.len().min(cursor.len())]
                        });
                        if !before_cursor {
                            dirs.push((entry.path(), child));
                        }
                    } else if let Ok(blob) = name.parse::<BlobId>() {
                        if !matches!(start_after, Some(after) if blob <= after) {
                            files.push((blob, entry.path()));
                        }
                    }
                }

                files.sort_by_key(|(blob, _)| *blob);
                for (blob, path) in files {
                    let meta = match tokio::fs::metadata(&path).await {
                        Ok(meta) => meta,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => Err(e)?,
                    };
                    yield ListedBlob {
                        blob,
                        last_modified: DateTime::<Utc>::from(meta.modified()?),
                    };
                }

                dirs.sort_by(|a, b| b.1.cmp(&a.1));
                pending.extend(dirs);
            }
        };
        stream.boxed()
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct FileEntry {
    modified: SystemTime,
    path: PathBuf,
    size: u64,
}

/// One walk over a store root.
struct FileScan {
    total_bytes: u64,
    /// At most `keep` least recently accessed files, oldest first.
    oldest: Vec<FileEntry>,
}

/// Walk every blob file under `root`, skipping the temp directory, and keep
/// the `keep` oldest in a bounded max-heap.
fn scan_files(root: &Path, keep: usize) -> io::Result<FileScan> {
    let mut total_bytes = 0u64;
    let mut oldest = BinaryHeap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if dir == root && entry.file_name() == TMP_DIR {
                    continue;
                }
                pending.push(entry.path());
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            total_bytes += meta.len();
            oldest.push(FileEntry {
                modified: meta.modified()?,
                path: entry.path(),
                size: meta.len(),
            });
            if oldest.len() > keep {
                oldest.pop();
            }
        }
    }
    Ok(FileScan {
        total_bytes,
        oldest: oldest.into_sorted_vec(),
    })
}

fn collect_garbage(config: &FileSystemConfig) -> BlobResult<GcReport> {
    let mut scan = scan_files(&config.root, config.max_files_per_pass)?;
    let bytes_before = scan.total_bytes;
    let trigger = (config.max_size_bytes as f64 * config.trigger_threshold) as u64;
    let target = (config.max_size_bytes as f64 * config.target_threshold) as u64;

    let mut report = GcReport {
        bytes_before,
        bytes_after: bytes_before,
        ..Default::default()
    };
    if bytes_before <= trigger {
        return Ok(report);
    }

    let mut usage = bytes_before;
    while usage > target && report.passes < config.max_passes {
        if report.passes > 0 {
            scan = scan_files(&config.root, config.max_files_per_pass)?;
            usage = scan.total_bytes;
        }
        report.passes += 1;
        if scan.oldest.is_empty() {
            break;
        }
        for file in scan.oldest.drain(..) {
            if usage <= target {
                break;
            }
            match std::fs::remove_file(&file.path) {
                Ok(()) => {
                    usage = usage.saturating_sub(file.size);
                    report.files_deleted += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    report.bytes_after = usage;
    Ok(report)
}
