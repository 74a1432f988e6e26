pub mod catalog;
pub mod http_pool;
pub mod manager;
pub mod notification;
pub mod scheduler;
pub mod strategies;
#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::{DownloadError, Result};
use crate::metadata::VideoMetadata;
use crate::utils::remove_file_if_exists;

pub use catalog::{Catalog, ClearReport, DownloadRecord, ReconcileReport};
pub use manager::{DownloadManager, RestoreReport};
pub use notification::{DownloadEvent, DownloadObserver, NotificationHub};
pub use scheduler::Scheduler;

/// Lifecycle of one transfer.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; a transfer reaching one
/// of them leaves the scheduler's live set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransferState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed | TransferState::Cancelled)
    }

    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Queued, Active) => true,
            (Active, Paused) => true,
            (Paused, Queued) => true,
            (Active, Completed) | (Active, Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// What a [`Downloader`] needs to run one attempt of a transfer.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub video_id: String,
    pub url: Url,
    /// Where bytes accumulate. Unique per generation, kept across pause/resume.
    pub partial_path: PathBuf,
    pub extension: String,
    pub generation: u64,
    /// 1 for the first run of a generation, incremented on every resume.
    pub attempt: u32,
    pub metadata: Option<VideoMetadata>,
}

impl TransferJob {
    /// Whether bytes from an earlier attempt of this generation may be reused.
    pub fn is_resumed(&self) -> bool {
        self.attempt > 1
    }

    pub fn is_protected(&self) -> bool {
        self.metadata.as_ref().map_or(false, VideoMetadata::is_protected)
    }
}

/// Point-in-time view of a live transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub video_id: String,
    pub url: Url,
    pub state: TransferState,
    /// Highest fraction observed so far, `0.0..=1.0`.
    pub progress: f64,
    pub generation: u64,
}

impl TransferSnapshot {
    pub fn percent(&self) -> f64 {
        self.progress * 100.0
    }
}

/// Result of an enqueue request. Duplicates are reported, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// A transfer for this video already exists in the given state; nothing changed.
    Duplicate(TransferState),
    AlreadyDownloaded,
}

#[derive(Debug)]
pub(crate) enum TransferEvent {
    Progress {
        video_id: String,
        generation: u64,
        attempt: u32,
        fraction: f64,
    },
    Finished {
        video_id: String,
        generation: u64,
        attempt: u32,
        result: std::result::Result<PathBuf, DownloadError>,
    },
}

/// Handed to a [`Downloader`] run to report how far it got.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    video_id: String,
    generation: u64,
    attempt: u32,
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ProgressReporter {
    pub(crate) fn new(job: &TransferJob, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            video_id: job.video_id.clone(),
            generation: job.generation,
            attempt: job.attempt,
            tx,
        }
    }

    /// Reports byte counts; without a known total nothing can be normalized and the call is ignored.
    pub fn report_bytes(&self, completed: u64, total: Option<u64>) {
        match total {
            Some(total) if total > 0 => self.report_fraction(completed as f64 / total as f64),
            _ => {}
        }
    }

    pub fn report_fraction(&self, fraction: f64) {
        if !fraction.is_finite() {
            return;
        }
        // The receiver only goes away during shutdown.
        let _ = self.tx.send(TransferEvent::Progress {
            video_id: self.video_id.clone(),
            generation: self.generation,
            attempt: self.attempt,
            fraction: fraction.clamp(0.0, 1.0),
        });
    }
}

/// The transfer mechanism behind the scheduler: fetches one asset to disk.
#[async_trait::async_trait]
pub trait Downloader: Send + Sync {
    /// Runs one attempt of `job`, writing into `job.partial_path`.
    ///
    /// Returns the path of the complete file, or `DownloadError::Cancelled`
    /// once `cancel` fires.
    async fn download(
        &self,
        job: &TransferJob,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> std::result::Result<PathBuf, DownloadError>;

    /// Deletes partial data left behind by `job`.
    async fn discard(&self, job: &TransferJob) -> Result<()> {
        remove_file_if_exists(&job.partial_path).await?;
        Ok(())
    }

    fn supports(&self, url: &Url) -> bool;

    fn get_name(&self) -> &str;
}

/// The public download contract consumed by UI code.
#[async_trait::async_trait]
pub trait VideoDownloadable: Send + Sync {
    async fn enqueue_download_with_metadata(
        &self,
        video_id: &str,
        url: &str,
        metadata: Option<VideoMetadata>,
    ) -> Result<EnqueueOutcome>;

    async fn enqueue_download(&self, video_id: &str, url: &str) -> Result<EnqueueOutcome> {
        self.enqueue_download_with_metadata(video_id, url, None).await
    }

    async fn pause_download(&self, video_id: &str) -> bool;

    async fn resume_download(&self, video_id: &str) -> bool;

    async fn dequeue_download(&self, video_id: &str) -> bool;

    async fn is_downloaded(&self, video_id: &str) -> bool {
        self.downloaded_list().await.iter().any(|id| id == video_id)
    }

    async fn downloaded_list(&self) -> Vec<String>;

    async fn get_location(&self, video_id: &str) -> Option<PathBuf>;

    /// Removes a completed download. `false` when `video_id` was never completed.
    async fn delete(&self, video_id: &str) -> bool;

    async fn clear(&self) -> ClearReport;

    async fn add(&self, observer: &Arc<dyn DownloadObserver>);

    async fn remove(&self, observer: &Arc<dyn DownloadObserver>);

    async fn restore(&self) -> Result<RestoreReport>;
}
