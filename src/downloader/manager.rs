use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::downloader::catalog::{Catalog, ClearReport, DownloadRecord, ReconcileReport};
use crate::downloader::notification::{DownloadObserver, NotificationHub};
use crate::downloader::scheduler::Scheduler;
use crate::downloader::strategies::HttpDownloader;
use crate::downloader::{Downloader, EnqueueOutcome, TransferSnapshot, VideoDownloadable};
use crate::errors::Result;
use crate::metadata::VideoMetadata;
use crate::security::InputValidator;
use crate::utils::ensure_dir_exists;

/// What [`DownloadManager::restore`] found and repaired.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub catalog: ReconcileReport,
    /// Partial files from transfers that are no longer live.
    pub partials_removed: usize,
}

impl RestoreReport {
    pub fn changed_anything(&self) -> bool {
        !self.catalog.is_consistent() || self.partials_removed > 0
    }
}

/// Process-wide download manager.
///
/// Construct one at startup, share it by reference or `Arc`, and call
/// [`DownloadManager::shutdown`] before exiting.
pub struct DownloadManager {
    config: AppConfig,
    catalog: Arc<Catalog>,
    scheduler: Scheduler,
    hub: NotificationHub,
    validator: InputValidator,
}

impl DownloadManager {
    /// Manager that fetches over HTTP(S) with the configured network settings.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let downloader = HttpDownloader::from_config(&config.network)?;
        Self::with_downloader(config, Arc::new(downloader)).await
    }

    pub async fn with_downloader(config: AppConfig, downloader: Arc<dyn Downloader>) -> Result<Self> {
        config.validate()?;
        ensure_dir_exists(&config.partial_dir()).await?;

        let catalog = Arc::new(Catalog::open(&config).await?);
        let hub = NotificationHub::start();
        let scheduler = Scheduler::start(&config, downloader.clone(), catalog.clone(), hub.clone());

        info!(
            "Download manager ready: storage {:?}, {} concurrent via {}",
            config.storage_dir,
            config.max_concurrent_downloads,
            downloader.get_name()
        );
        Ok(Self {
            config,
            catalog,
            scheduler,
            hub,
            validator: InputValidator::new(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Live transfer for `video_id`, if any.
    pub async fn transfer(&self, video_id: &str) -> Option<TransferSnapshot> {
        self.scheduler.transfer(video_id).await
    }

    pub async fn transfers(&self) -> Vec<TransferSnapshot> {
        self.scheduler.transfers().await
    }

    /// Completed downloads with their stored metadata, in completion order.
    pub async fn records(&self) -> Vec<DownloadRecord> {
        self.catalog.records().await
    }

    pub async fn record(&self, video_id: &str) -> Option<DownloadRecord> {
        self.catalog.get(video_id).await
    }

    /// Cancels live transfers and stops event delivery. Completed downloads stay on disk.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.hub.shutdown().await;
        info!("Download manager shut down");
    }
}

#[async_trait::async_trait]
impl VideoDownloadable for DownloadManager {
    async fn enqueue_download_with_metadata(
        &self,
        video_id: &str,
        url: &str,
        metadata: Option<VideoMetadata>,
    ) -> Result<EnqueueOutcome> {
        self.validator.validate_video_id(video_id)?;
        let url = self.validator.validate_source_url(url)?;

        if self.catalog.has(video_id).await {
            info!("{} is already downloaded", video_id);
            return Ok(EnqueueOutcome::AlreadyDownloaded);
        }
        self.scheduler.enqueue(video_id, url, metadata).await
    }

    async fn pause_download(&self, video_id: &str) -> bool {
        self.scheduler.pause(video_id).await
    }

    async fn resume_download(&self, video_id: &str) -> bool {
        self.scheduler.resume(video_id).await
    }

    async fn dequeue_download(&self, video_id: &str) -> bool {
        self.scheduler.dequeue(video_id).await
    }

    async fn is_downloaded(&self, video_id: &str) -> bool {
        self.catalog.has(video_id).await
    }

    async fn downloaded_list(&self) -> Vec<String> {
        self.catalog.list().await
    }

    async fn get_location(&self, video_id: &str) -> Option<PathBuf> {
        self.catalog.locate(video_id).await
    }

    async fn delete(&self, video_id: &str) -> bool {
        match self.catalog.remove(video_id).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Delete of {} failed: {}", video_id, e);
                false
            }
        }
    }

    async fn clear(&self) -> ClearReport {
        self.catalog.clear().await
    }

    async fn add(&self, observer: &Arc<dyn DownloadObserver>) {
        self.hub.add(observer).await;
    }

    async fn remove(&self, observer: &Arc<dyn DownloadObserver>) {
        self.hub.remove(observer).await;
    }

    async fn restore(&self) -> Result<RestoreReport> {
        let catalog = self.catalog.reload().await?;
        let partials_removed = self.scheduler.sweep_partials().await?;
        let report = RestoreReport { catalog, partials_removed };
        if report.changed_anything() {
            info!("Restore repaired storage: {:?}", report);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::notification::DownloadEvent;
    use crate::downloader::testing::{test_config, RecordingObserver, Script, ScriptedDownloader};
    use crate::downloader::TransferState;
    use crate::errors::{AppError, DownloadError};
    use crate::security::input_validation::MAX_VIDEO_ID_LEN;
    use tempfile::TempDir;

    async fn manager(
        dir: &TempDir,
        max_concurrent: usize,
    ) -> (DownloadManager, Arc<ScriptedDownloader>, Arc<RecordingObserver>, Arc<dyn DownloadObserver>) {
        let downloader = ScriptedDownloader::new();
        let manager = DownloadManager::with_downloader(test_config(dir.path(), max_concurrent), downloader.clone())
            .await
            .unwrap();
        let observer = RecordingObserver::new();
        let handle: Arc<dyn DownloadObserver> = observer.clone();
        manager.add(&handle).await;
        (manager, downloader, observer, handle)
    }

    fn url(video_id: &str) -> String {
        format!("https://cdn.example.com/{}.mp4", video_id)
    }

    async fn download(manager: &DownloadManager, observer: &RecordingObserver, video_id: &str) {
        manager.enqueue_download(video_id, &url(video_id)).await.unwrap();
        assert_eq!(
            observer.wait_for_terminal(video_id).await,
            DownloadEvent::Completed { video_id: video_id.into() }
        );
    }

    #[tokio::test]
    async fn unknown_video_is_not_downloaded() {
        let dir = TempDir::new().unwrap();
        let (manager, _, _, _) = manager(&dir, 1).await;
        assert!(!manager.is_downloaded("never").await);
        assert!(manager.get_location("never").await.is_none());
        assert!(manager.downloaded_list().await.is_empty());
    }

    #[tokio::test]
    async fn complete_then_delete() {
        let dir = TempDir::new().unwrap();
        let (manager, _, observer, _handle) = manager(&dir, 1).await;

        download(&manager, &observer, "a").await;
        assert!(manager.is_downloaded("a").await);
        let location = manager.get_location("a").await.unwrap();
        assert!(location.exists());
        assert_eq!(location.extension().and_then(|e| e.to_str()), Some("mp4"));

        assert!(manager.delete("a").await);
        assert!(!manager.is_downloaded("a").await);
        assert!(manager.get_location("a").await.is_none());
        assert!(!location.exists());
    }

    #[tokio::test]
    async fn delete_without_record_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let (manager, _, observer, _handle) = manager(&dir, 1).await;
        download(&manager, &observer, "kept").await;

        assert!(!manager.delete("missing").await);
        assert_eq!(manager.downloaded_list().await, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn delete_does_not_touch_live_transfer() {
        let dir = TempDir::new().unwrap();
        let (manager, downloader, _, _handle) = manager(&dir, 1).await;
        let (script, _gate) = Script::gated();
        downloader.script("a", script);

        manager.enqueue_download("a", &url("a")).await.unwrap();
        assert!(!manager.delete("a").await);
        assert_eq!(manager.transfer("a").await.unwrap().state, TransferState::Active);
    }

    #[tokio::test]
    async fn enqueue_of_downloaded_video_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let (manager, downloader, observer, _handle) = manager(&dir, 1).await;
        download(&manager, &observer, "a").await;

        let outcome = manager.enqueue_download("a", &url("a")).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::AlreadyDownloaded);
        assert_eq!(downloader.runs_for("a").len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (manager, _, _, _) = manager(&dir, 1).await;
        assert!(matches!(
            manager.enqueue_download("", &url("a")).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            manager.enqueue_download("a", "file:///etc/passwd").await,
            Err(AppError::Validation(_))
        ));
        assert!(manager.transfers().await.is_empty());
    }

    #[tokio::test]
    async fn longest_accepted_id_downloads() {
        let dir = TempDir::new().unwrap();
        let (manager, _, observer, _handle) = manager(&dir, 1).await;
        let longest = "k".repeat(MAX_VIDEO_ID_LEN);

        download(&manager, &observer, &longest).await;
        assert!(manager.is_downloaded(&longest).await);
        assert!(manager.get_location(&longest).await.unwrap().exists());

        assert!(matches!(
            manager.enqueue_download(&format!("{}k", longest), &url("k")).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn metadata_is_kept_with_the_record() {
        let dir = TempDir::new().unwrap();
        let (manager, _, observer, _handle) = manager(&dir, 1).await;

        manager
            .enqueue_download_with_metadata("a", &url("a"), Some(VideoMetadata::titled("Lecture 1")))
            .await
            .unwrap();
        observer.wait_for_terminal("a").await;

        let record = manager.record("a").await.unwrap();
        assert_eq!(record.metadata.unwrap().title.as_deref(), Some("Lecture 1"));
        assert_eq!(record.size_bytes, Some(64));
    }

    #[tokio::test]
    async fn queued_video_starts_when_active_one_finishes() {
        let dir = TempDir::new().unwrap();
        let (manager, downloader, observer, _handle) = manager(&dir, 1).await;
        let (script, gate) = Script::gated();
        downloader.script("b", script);

        manager.enqueue_download("b", &url("b")).await.unwrap();
        manager.enqueue_download("a", &url("a")).await.unwrap();
        assert_eq!(manager.transfer("b").await.unwrap().state, TransferState::Active);
        assert_eq!(manager.transfer("a").await.unwrap().state, TransferState::Queued);

        gate.add_permits(16);
        observer.wait_for_terminal("b").await;
        observer.wait_for_terminal("a").await;
        assert_eq!(manager.downloaded_list().await, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn clear_self_heals_missing_file() {
        let dir = TempDir::new().unwrap();
        let (manager, _, observer, _handle) = manager(&dir, 1).await;
        for id in ["one", "two", "three"] {
            download(&manager, &observer, id).await;
        }
        let gone = manager.get_location("two").await.unwrap();
        tokio::fs::remove_file(&gone).await.unwrap();

        let report = manager.clear().await;
        assert_eq!(report.removed, vec!["one".to_string(), "three".to_string()]);
        assert_eq!(report.missing, vec!["two".to_string()]);
        assert_eq!(report.discrepancies(), 1);
        assert!(report.failed.is_empty());
        assert!(manager.downloaded_list().await.is_empty());
    }

    #[tokio::test]
    async fn failure_leaves_video_undownloaded() {
        let dir = TempDir::new().unwrap();
        let (manager, downloader, observer, _handle) = manager(&dir, 1).await;
        downloader.script("a", Script::failing_at(1, DownloadError::Storage("disk full".into())));

        manager.enqueue_download("a", &url("a")).await.unwrap();
        assert_eq!(
            observer.wait_for_terminal("a").await,
            DownloadEvent::Error {
                video_id: "a".into(),
                error: DownloadError::Storage("disk full".into()),
            }
        );
        assert!(!manager.is_downloaded("a").await);

        // A failed transfer can be enqueued again.
        downloader.script("a", Script::default());
        assert_eq!(
            manager.enqueue_download("a", &url("a")).await.unwrap(),
            EnqueueOutcome::Queued
        );
    }

    #[tokio::test]
    async fn removed_observer_hears_nothing_more() {
        let dir = TempDir::new().unwrap();
        let (manager, _, observer, handle) = manager(&dir, 1).await;
        let other = RecordingObserver::new();
        let other_handle: Arc<dyn DownloadObserver> = other.clone();
        manager.add(&other_handle).await;
        manager.remove(&handle).await;

        download(&manager, &other, "a").await;
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn restore_after_restart_discards_unfinished_transfer() {
        let dir = TempDir::new().unwrap();
        {
            let (manager, downloader, observer, _handle) = manager(&dir, 1).await;
            download(&manager, &observer, "done").await;

            let (script, gate) = Script::gated();
            downloader.script("unfinished", script);
            manager.enqueue_download("unfinished", &url("unfinished")).await.unwrap();
            gate.add_permits(2);
            observer.wait_for_progress("unfinished", 50.0).await;
            manager.shutdown().await;
        }

        let (manager, _, _, _) = manager(&dir, 1).await;
        let report = manager.restore().await.unwrap();
        assert_eq!(report.partials_removed, 1);
        assert!(!manager.is_downloaded("unfinished").await);
        assert!(manager.get_location("unfinished").await.is_none());
        assert!(manager.is_downloaded("done").await);

        let mut partials = tokio::fs::read_dir(manager.config().partial_dir()).await.unwrap();
        assert!(partials.next_entry().await.unwrap().is_none());

        let again = manager.restore().await.unwrap();
        assert!(!again.changed_anything());
    }

    #[tokio::test]
    async fn operations_after_shutdown_fail_cleanly() {
        let dir = TempDir::new().unwrap();
        let (manager, _, _, _) = manager(&dir, 1).await;
        manager.shutdown().await;

        assert!(matches!(
            manager.enqueue_download("a", &url("a")).await,
            Err(AppError::Shutdown)
        ));
        assert!(!manager.pause_download("a").await);
        assert!(!manager.dequeue_download("a").await);
    }
}
