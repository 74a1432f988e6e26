use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::metadata::{DrmInfo, VideoMetadata};
use crate::utils::{ensure_dir_exists, media_file_stem, remove_file_if_exists, video_id_from_stem};

const INDEX_VERSION: u32 = 1;

/// A completed download. Exists only while its file does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub video_id: String,
    pub local_path: PathBuf,
    pub size_bytes: Option<u64>,
    pub completed_at: DateTime<Utc>,
    pub metadata: Option<VideoMetadata>,
}

impl DownloadRecord {
    pub fn drm(&self) -> Option<&DrmInfo> {
        self.metadata.as_ref().and_then(|m| m.drm.as_ref())
    }
}

/// On-disk layout of the index file. Records are kept in completion order.
#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    records: Vec<DownloadRecord>,
}

enum IndexRead {
    Loaded(IndexFile),
    Missing,
    Quarantined,
}

/// Outcome of a best-effort [`Catalog::clear`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClearReport {
    /// Records whose file was deleted.
    pub removed: Vec<String>,
    /// Records whose file was already gone; the record was dropped anyway.
    pub missing: Vec<String>,
    /// Records kept because their file could not be deleted, with the reason.
    pub failed: Vec<(String, String)>,
    /// Set when the emptied index could not be written back.
    pub index_error: Option<String>,
}

impl ClearReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies() == 0 && self.index_error.is_none()
    }

    pub fn discrepancies(&self) -> usize {
        self.missing.len() + self.failed.len()
    }
}

/// What loading the index had to repair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub loaded: usize,
    /// Records dropped because their file no longer exists.
    pub dropped: Vec<String>,
    /// Files in the media directory that no record referenced.
    pub orphans_removed: usize,
    /// The index could not be parsed and was set aside.
    pub index_recovered: bool,
    /// Records recreated from media file names after the index was set aside.
    pub rebuilt: Vec<String>,
}

impl ReconcileReport {
    /// Records in the catalog once reconciliation finished.
    pub fn kept(&self) -> usize {
        self.loaded - self.dropped.len() + self.rebuilt.len()
    }

    pub fn is_consistent(&self) -> bool {
        self.dropped.is_empty() && self.orphans_removed == 0 && !self.index_recovered
    }
}

/// Durable index of completed downloads plus the media directory it describes.
///
/// Every mutation holds the write lock for its whole duration, so readers see
/// either the state before or after it.
pub struct Catalog {
    media_dir: PathBuf,
    index_path: PathBuf,
    records: RwLock<IndexMap<String, DownloadRecord>>,
}

impl Catalog {
    /// Opens the catalog described by `config`, reconciling it against the disk.
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let catalog = Self::new(config.media_dir(), config.index_path());
        let report = catalog.reload().await?;
        info!(
            "Catalog opened with {} downloads ({} dropped, {} orphan files removed)",
            report.kept(),
            report.dropped.len(),
            report.orphans_removed
        );
        Ok(catalog)
    }

    fn new(media_dir: PathBuf, index_path: PathBuf) -> Self {
        Self {
            media_dir,
            index_path,
            records: RwLock::new(IndexMap::new()),
        }
    }

    /// Re-reads the index from disk and repairs it.
    ///
    /// Records whose file is missing are dropped and media files nobody references
    /// are deleted. An unreadable index is moved aside and the records are
    /// rebuilt from the media file names instead. Running it twice in
    /// a row changes nothing the second time.
    pub async fn reload(&self) -> Result<ReconcileReport> {
        let mut records = self.records.write().await;
        ensure_dir_exists(&self.media_dir).await?;

        let mut report = ReconcileReport::default();
        let loaded = match self.read_index().await? {
            IndexRead::Loaded(index) => index.records,
            IndexRead::Missing => Vec::new(),
            IndexRead::Quarantined => {
                report.index_recovered = true;
                Vec::new()
            }
        };
        report.loaded = loaded.len();

        let mut reconciled = IndexMap::with_capacity(loaded.len());
        for record in loaded {
            if is_file(&record.local_path).await {
                reconciled.insert(record.video_id.clone(), record);
            } else {
                warn!(
                    "Dropping download record for {}: file {:?} is missing",
                    record.video_id, record.local_path
                );
                report.dropped.push(record.video_id);
            }
        }

        // Without a readable index every media file looks unreferenced.
        if report.index_recovered {
            reconciled = self.rebuild_from_media().await?;
            report.rebuilt = reconciled.keys().cloned().collect();
            warn!(
                "Rebuilt {} download records from {:?}; orphan sweep skipped",
                report.rebuilt.len(),
                self.media_dir
            );
        } else {
            report.orphans_removed = self.remove_orphans(&reconciled).await?;
        }

        if !report.dropped.is_empty() || report.index_recovered {
            self.persist(&reconciled).await?;
        }

        *records = reconciled;
        Ok(report)
    }

    /// True iff a record exists and its file is on disk.
    pub async fn has(&self, video_id: &str) -> bool {
        self.locate(video_id).await.is_some()
    }

    pub async fn locate(&self, video_id: &str) -> Option<PathBuf> {
        let records = self.records.read().await;
        let record = records.get(video_id)?;
        if is_file(&record.local_path).await {
            Some(record.local_path.clone())
        } else {
            None
        }
    }

    /// Downloaded video ids in completion order.
    pub async fn list(&self) -> Vec<String> {
        let records = self.records.read().await;
        let mut ids = Vec::with_capacity(records.len());
        for record in records.values() {
            if is_file(&record.local_path).await {
                ids.push(record.video_id.clone());
            }
        }
        ids
    }

    pub async fn get(&self, video_id: &str) -> Option<DownloadRecord> {
        self.records.read().await.get(video_id).cloned()
    }

    pub async fn records(&self) -> Vec<DownloadRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Moves the finished file at `source` into the media directory and records it.
    ///
    /// Committing an id that is already present replaces its record and file
    /// in place; `list` keeps the original position.
    pub async fn commit(
        &self,
        video_id: &str,
        source: &Path,
        extension: &str,
        metadata: Option<VideoMetadata>,
    ) -> Result<DownloadRecord> {
        let mut records = self.records.write().await;
        ensure_dir_exists(&self.media_dir).await?;

        let destination = self
            .media_dir
            .join(format!("{}.{}", media_file_stem(video_id), extension));
        if source != destination {
            move_file(source, &destination).await?;
        }
        let size = tokio::fs::metadata(&destination).await?.len();

        let record = DownloadRecord {
            video_id: video_id.to_string(),
            local_path: destination.clone(),
            size_bytes: Some(size),
            completed_at: Utc::now(),
            metadata,
        };

        let mut next = records.clone();
        let previous = next.insert(video_id.to_string(), record.clone());

        if let Err(e) = self.persist(&next).await {
            // Without a durable record the file must not stay behind.
            if previous.as_ref().map_or(true, |p| p.local_path != destination) {
                if let Err(remove_err) = remove_file_if_exists(&destination).await {
                    warn!("Failed to remove uncommitted file {:?}: {}", destination, remove_err);
                }
            }
            return Err(e);
        }

        if let Some(previous) = previous {
            if previous.local_path != destination {
                if let Err(e) = remove_file_if_exists(&previous.local_path).await {
                    warn!("Failed to remove replaced file {:?}: {}", previous.local_path, e);
                }
            }
        }

        *records = next;
        info!("Committed download {} ({} bytes) at {:?}", video_id, size, destination);
        Ok(record)
    }

    /// Deletes the file, then the record.
    ///
    /// `Ok(false)` when no record exists. A file that cannot be deleted leaves
    /// the record in place and is returned as an error.
    pub async fn remove(&self, video_id: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        let record = match records.get(video_id) {
            Some(record) => record.clone(),
            None => return Ok(false),
        };

        match remove_file_if_exists(&record.local_path).await {
            Ok(true) => debug!("Deleted {:?}", record.local_path),
            Ok(false) => warn!("File for {} was already missing: {:?}", video_id, record.local_path),
            Err(e) => {
                return Err(AppError::Storage(format!(
                    "Failed to delete {:?} for {}: {}",
                    record.local_path, video_id, e
                )));
            }
        }

        records.shift_remove(video_id);
        if let Err(e) = self.persist(&records).await {
            // The file is gone, so the stale entry is dropped on the next reload.
            warn!("Removed {} but could not rewrite the index: {}", video_id, e);
        }
        info!("Removed download {}", video_id);
        Ok(true)
    }

    /// Deletes every file and record, continuing past individual failures.
    pub async fn clear(&self) -> ClearReport {
        let mut records = self.records.write().await;
        let mut report = ClearReport::default();
        let mut retained = IndexMap::new();

        for (video_id, record) in records.iter() {
            match remove_file_if_exists(&record.local_path).await {
                Ok(true) => report.removed.push(video_id.clone()),
                Ok(false) => {
                    warn!("File for {} was already missing during clear", video_id);
                    report.missing.push(video_id.clone());
                }
                Err(e) => {
                    warn!("Failed to delete {:?} during clear: {}", record.local_path, e);
                    report.failed.push((video_id.clone(), e.to_string()));
                    retained.insert(video_id.clone(), record.clone());
                }
            }
        }

        if let Err(e) = self.persist(&retained).await {
            error!("Failed to write index after clear: {}", e);
            report.index_error = Some(e.to_string());
        }

        *records = retained;
        info!(
            "Cleared catalog: {} removed, {} missing, {} failed",
            report.removed.len(),
            report.missing.len(),
            report.failed.len()
        );
        report
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.index_path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    async fn read_index(&self) -> Result<IndexRead> {
        let content = match tokio::fs::read(&self.index_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IndexRead::Missing),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<IndexFile>(&content) {
            Ok(index) => {
                if index.version != INDEX_VERSION {
                    warn!("Index version {} differs from {}; reading anyway", index.version, INDEX_VERSION);
                }
                Ok(IndexRead::Loaded(index))
            }
            Err(e) => {
                let corrupt = self.corrupt_path();
                warn!("Index {:?} is unreadable ({}); moving it to {:?}", self.index_path, e, corrupt);
                tokio::fs::rename(&self.index_path, &corrupt).await?;
                Ok(IndexRead::Quarantined)
            }
        }
    }

    /// Records for every media file whose stem decodes to a video id, oldest first.
    ///
    /// Metadata is lost with the index. Files with other names are left alone.
    async fn rebuild_from_media(&self) -> Result<IndexMap<String, DownloadRecord>> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.media_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let video_id = match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(video_id_from_stem)
            {
                Some(video_id) => video_id,
                None => continue,
            };
            let completed_at = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            found.push(DownloadRecord {
                video_id,
                local_path: path,
                size_bytes: Some(meta.len()),
                completed_at,
                metadata: None,
            });
        }

        found.sort_by_key(|record| record.completed_at);
        let mut rebuilt = IndexMap::with_capacity(found.len());
        for record in found {
            debug!("Recovered {} from {:?}", record.video_id, record.local_path);
            rebuilt.insert(record.video_id.clone(), record);
        }
        Ok(rebuilt)
    }

    async fn remove_orphans(&self, records: &IndexMap<String, DownloadRecord>) -> Result<usize> {
        let referenced: HashSet<&Path> = records.values().map(|r| r.local_path.as_path()).collect();
        let mut removed = 0;

        let mut entries = tokio::fs::read_dir(&self.media_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() || referenced.contains(path.as_path()) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed orphan media file {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove orphan media file {:?}: {}", path, e),
            }
        }
        Ok(removed)
    }

    async fn persist(&self, records: &IndexMap<String, DownloadRecord>) -> Result<()> {
        let index = IndexFile {
            version: INDEX_VERSION,
            records: records.values().cloned().collect(),
        };
        let path = self.index_path.clone();
        tokio::task::spawn_blocking(move || write_index_atomically(&path, &index))
            .await
            .map_err(|e| AppError::Catalog(format!("Index writer failed: {}", e)))?
    }
}

/// Temp file in the same directory, fsync, then rename over the old index.
fn write_index_atomically(path: &Path, index: &IndexFile) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Catalog(format!("Index path {:?} has no parent", path)))?;
    std::fs::create_dir_all(dir)?;

    let content = serde_json::to_vec_pretty(index)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(&content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}

async fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if tokio::fs::rename(source, destination).await.is_ok() {
        return Ok(());
    }
    // Different filesystem: copy, then drop the source.
    tokio::fs::copy(source, destination).await.map_err(|e| {
        AppError::Storage(format!("Failed to move {:?} to {:?}: {}", source, destination, e))
    })?;
    remove_file_if_exists(source).await?;
    Ok(())
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
