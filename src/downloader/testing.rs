//! Test doubles shared by the scheduler, manager and hub tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::notification::{DownloadEvent, DownloadObserver};
use super::{Downloader, ProgressReporter, TransferJob};
use crate::config::AppConfig;
use crate::errors::DownloadError;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub(crate) fn test_config(storage: &Path, max_concurrent: usize) -> AppConfig {
    let mut config = AppConfig::with_storage_dir(storage);
    config.max_concurrent_downloads = max_concurrent;
    config.progress_step_percent = 0.0;
    config
}

pub(crate) struct RecordingObserver {
    events: Mutex<Vec<DownloadEvent>>,
    changed: Notify,
}

impl RecordingObserver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            changed: Notify::new(),
        })
    }

    pub(crate) fn events(&self) -> Vec<DownloadEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn events_for(&self, video_id: &str) -> Vec<DownloadEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.video_id() == video_id)
            .collect()
    }

    pub(crate) fn progress_for(&self, video_id: &str) -> Vec<f64> {
        self.events_for(video_id)
            .into_iter()
            .filter_map(|event| match event {
                DownloadEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect()
    }

    /// Waits until `predicate` holds over everything recorded so far.
    pub(crate) async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn(&[DownloadEvent]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            if predicate(&self.events()) {
                return;
            }
            if tokio::time::timeout_at(deadline, self.changed.notified()).await.is_err() {
                panic!("timed out waiting for events; recorded: {:?}", self.events());
            }
        }
    }

    pub(crate) async fn wait_for_terminal(&self, video_id: &str) -> DownloadEvent {
        self.wait_until(|events| {
            events.iter().any(|e| e.video_id() == video_id && e.is_terminal())
        })
        .await;
        self.events_for(video_id)
            .into_iter()
            .find(DownloadEvent::is_terminal)
            .unwrap()
    }

    pub(crate) async fn wait_for_progress(&self, video_id: &str, at_least: f64) {
        self.wait_until(|events| {
            events.iter().any(|e| {
                matches!(e, DownloadEvent::Progress { video_id: id, percent } if id == video_id && *percent >= at_least)
            })
        })
        .await;
    }

    fn record(&self, event: DownloadEvent) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_one();
    }
}

impl DownloadObserver for RecordingObserver {
    fn on_progress(&self, video_id: &str, percent: f64) {
        self.record(DownloadEvent::Progress { video_id: video_id.to_string(), percent });
    }

    fn on_error(&self, video_id: &str, error: &DownloadError) {
        self.record(DownloadEvent::Error { video_id: video_id.to_string(), error: error.clone() });
    }

    fn on_complete(&self, video_id: &str) {
        self.record(DownloadEvent::Completed { video_id: video_id.to_string() });
    }

    fn on_cancelled(&self, video_id: &str) {
        self.record(DownloadEvent::Cancelled { video_id: video_id.to_string() });
    }
}

/// How a [`ScriptedDownloader`] behaves for one video.
#[derive(Clone)]
pub(crate) struct Script {
    pub chunks: u64,
    pub chunk_size: u64,
    /// Each chunk waits for one permit when set.
    pub gate: Option<Arc<Semaphore>>,
    /// Fail before writing chunk number `n` (zero-based).
    pub fail_at: Option<(u64, DownloadError)>,
    /// Ignore bytes from earlier attempts, like a server without range support.
    pub restart_on_resume: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            chunks: 4,
            chunk_size: 16,
            gate: None,
            fail_at: None,
            restart_on_resume: false,
        }
    }
}

impl Script {
    pub(crate) fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let script = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (script, gate)
    }

    pub(crate) fn failing_at(chunk: u64, error: DownloadError) -> Self {
        Self {
            fail_at: Some((chunk, error)),
            ..Self::default()
        }
    }
}

/// In-memory transfer mechanism driven by per-video [`Script`]s.
#[derive(Default)]
pub(crate) struct ScriptedDownloader {
    scripts: Mutex<HashMap<String, Script>>,
    runs: Mutex<Vec<(String, u64, u32)>>,
}

impl ScriptedDownloader {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, video_id: &str, script: Script) {
        self.scripts.lock().unwrap().insert(video_id.to_string(), script);
    }

    /// `(video_id, generation, attempt)` for every run started.
    pub(crate) fn runs(&self) -> Vec<(String, u64, u32)> {
        self.runs.lock().unwrap().clone()
    }

    pub(crate) fn runs_for(&self, video_id: &str) -> Vec<(u64, u32)> {
        self.runs()
            .into_iter()
            .filter(|(id, _, _)| id == video_id)
            .map(|(_, generation, attempt)| (generation, attempt))
            .collect()
    }
}

#[async_trait::async_trait]
impl Downloader for ScriptedDownloader {
    async fn download(
        &self,
        job: &TransferJob,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        self.runs
            .lock()
            .unwrap()
            .push((job.video_id.clone(), job.generation, job.attempt));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&job.video_id)
            .cloned()
            .unwrap_or_default();

        if let Some(parent) = job.partial_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let total = script.chunks * script.chunk_size;
        let mut written = if job.is_resumed() && !script.restart_on_resume {
            tokio::fs::metadata(&job.partial_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            0
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(written > 0)
            .truncate(written == 0)
            .open(&job.partial_path)
            .await?;

        while written < total {
            match &script.gate {
                Some(gate) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        permit = gate.acquire() => {
                            permit.map_err(|e| DownloadError::Network(e.to_string()))?.forget();
                        }
                    }
                }
                None => tokio::task::yield_now().await,
            }
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if let Some((at, error)) = &script.fail_at {
                if written / script.chunk_size >= *at {
                    return Err(error.clone());
                }
            }
            file.write_all(&vec![b'v'; script.chunk_size as usize]).await?;
            written += script.chunk_size;
            progress.report_bytes(written, Some(total));
        }
        file.flush().await?;
        Ok(job.partial_path.clone())
    }

    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn get_name(&self) -> &str {
        "scripted"
    }
}
