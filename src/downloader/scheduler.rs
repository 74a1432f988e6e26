use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use super::catalog::Catalog;
use super::notification::NotificationHub;
use super::{
    Downloader, EnqueueOutcome, ProgressReporter, TransferEvent, TransferJob, TransferSnapshot,
    TransferState,
};
use crate::config::AppConfig;
use crate::errors::{AppError, DownloadError, Result};
use crate::metadata::VideoMetadata;
use crate::utils::{container_extension, media_file_stem, remove_file_if_exists, video_id_from_stem};

/// A live transfer. Owned by the scheduler until it reaches a terminal state.
struct Transfer {
    job: TransferJob,
    state: TransferState,
    /// Enqueue order, used for FIFO admission.
    seq: u64,
    /// Highest fraction seen across all attempts of this generation.
    progress: f64,
    reported_percent: Option<f64>,
    /// Cancelled on dequeue; observers drop events tied to it from then on.
    generation_token: CancellationToken,
    /// Child of `generation_token`, cancelled on pause.
    run_token: Option<CancellationToken>,
    run_handle: Option<JoinHandle<()>>,
}

impl Transfer {
    fn transition(&mut self, next: TransferState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("{}: {:?} -> {:?}", self.job.video_id, self.state, next);
        self.state = next;
    }

    fn is_current(&self, generation: u64, attempt: u32) -> bool {
        self.job.generation == generation && self.job.attempt == attempt
    }

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            video_id: self.job.video_id.clone(),
            url: self.job.url.clone(),
            state: self.state,
            progress: self.progress,
            generation: self.job.generation,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    transfers: HashMap<String, Transfer>,
    active: usize,
    next_generation: u64,
    next_seq: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    downloader: Arc<dyn Downloader>,
    catalog: Arc<Catalog>,
    hub: NotificationHub,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    partial_dir: PathBuf,
    max_concurrent: usize,
    progress_step: f64,
    notify_cancelled: bool,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Admission control and lifecycle of transfers.
///
/// Every decision (enqueue, pause, resume, dequeue, admission, completion)
/// runs under one lock. At most one transfer exists per video id and at most
/// `max_concurrent_downloads` are `Active`.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Starts the event loop that consumes transfer progress and results.
    pub fn start(
        config: &AppConfig,
        downloader: Arc<dyn Downloader>,
        catalog: Arc<Catalog>,
        hub: NotificationHub,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            downloader,
            catalog,
            hub,
            events_tx,
            partial_dir: config.partial_dir(),
            max_concurrent: config.max_concurrent_downloads.max(1),
            progress_step: config.progress_step_percent,
            notify_cancelled: config.notify_cancelled,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });
        shared.tracker.spawn(event_loop(shared.clone(), events_rx));
        Self { shared }
    }

    /// Creates a transfer for `video_id` unless one is already live.
    pub async fn enqueue(
        &self,
        video_id: &str,
        url: Url,
        metadata: Option<VideoMetadata>,
    ) -> Result<EnqueueOutcome> {
        if !self.shared.downloader.supports(&url) {
            return Err(AppError::Validation(format!(
                "{} cannot fetch {}",
                self.shared.downloader.get_name(),
                url
            )));
        }

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(AppError::Shutdown);
        }
        if let Some(existing) = state.transfers.get(video_id) {
            debug!("Ignoring duplicate enqueue for {} ({:?})", video_id, existing.state);
            return Ok(EnqueueOutcome::Duplicate(existing.state));
        }

        state.next_generation += 1;
        state.next_seq += 1;
        let generation = state.next_generation;
        let partial_path = self
            .shared
            .partial_dir
            .join(format!("{}.{}.part", media_file_stem(video_id), generation));

        let transfer = Transfer {
            job: TransferJob {
                video_id: video_id.to_string(),
                extension: container_extension(&url),
                url,
                partial_path,
                generation,
                attempt: 0,
                metadata,
            },
            state: TransferState::Queued,
            seq: state.next_seq,
            progress: 0.0,
            reported_percent: None,
            generation_token: CancellationToken::new(),
            run_token: None,
            run_handle: None,
        };
        state.transfers.insert(video_id.to_string(), transfer);
        info!("Queued {} (generation {})", video_id, generation);

        self.shared.admit(&mut state);
        Ok(EnqueueOutcome::Queued)
    }

    /// Suspends an active transfer, keeping its partial data. No-op unless `Active`.
    pub async fn pause(&self, video_id: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        match state.transfers.get_mut(video_id) {
            Some(transfer) if transfer.state == TransferState::Active => {
                transfer.transition(TransferState::Paused);
                if let Some(token) = transfer.run_token.take() {
                    token.cancel();
                }
            }
            _ => return false,
        }
        state.active -= 1;
        info!("Paused {}", video_id);

        self.shared.admit(&mut state);
        true
    }

    /// Puts a paused transfer back in line. No-op unless `Paused`.
    pub async fn resume(&self, video_id: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        match state.transfers.get_mut(video_id) {
            Some(transfer) if transfer.state == TransferState::Paused => {
                transfer.transition(TransferState::Queued);
            }
            _ => return false,
        }
        info!("Resumed {}", video_id);

        self.shared.admit(&mut state);
        true
    }

    /// Cancels a live transfer and discards its partial data.
    ///
    /// Once this returns, no event from the cancelled generation reaches observers.
    pub async fn dequeue(&self, video_id: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        let mut transfer = match state.transfers.remove(video_id) {
            Some(transfer) => transfer,
            None => return false,
        };

        transfer.generation_token.cancel();
        if transfer.state == TransferState::Active {
            state.active -= 1;
        }
        transfer.transition(TransferState::Cancelled);
        info!("Dequeued {} (generation {})", video_id, transfer.job.generation);

        let downloader = self.shared.downloader.clone();
        let run = transfer.run_handle.take();
        let job = transfer.job;
        self.shared.tracker.spawn(async move {
            if let Some(run) = run {
                let _ = run.await;
            }
            if let Err(e) = downloader.discard(&job).await {
                warn!("Failed to discard partial data for {}: {}", job.video_id, e);
            }
        });

        if self.shared.notify_cancelled {
            self.shared.hub.cancelled(video_id);
        }

        self.shared.admit(&mut state);
        true
    }

    pub async fn transfer(&self, video_id: &str) -> Option<TransferSnapshot> {
        let state = self.shared.state.lock().await;
        state.transfers.get(video_id).map(Transfer::snapshot)
    }

    /// Live transfers in enqueue order.
    pub async fn transfers(&self) -> Vec<TransferSnapshot> {
        let state = self.shared.state.lock().await;
        let mut transfers: Vec<&Transfer> = state.transfers.values().collect();
        transfers.sort_by_key(|t| t.seq);
        transfers.into_iter().map(Transfer::snapshot).collect()
    }

    /// Deletes partial files that no live transfer owns. Returns how many were removed.
    pub async fn sweep_partials(&self) -> Result<usize> {
        let state = self.shared.state.lock().await;
        let owned: HashSet<&Path> = state
            .transfers
            .values()
            .map(|t| t.job.partial_path.as_path())
            .collect();

        let mut entries = match tokio::fs::read_dir(&self.shared.partial_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if owned.contains(path.as_path()) || !entry.file_type().await?.is_file() {
                continue;
            }
            match remove_file_if_exists(&path).await {
                Ok(_) => {
                    info!("Discarded stale partial download for {}", describe_partial(&path));
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove stale partial {:?}: {}", path, e),
            }
        }
        Ok(removed)
    }

    /// Stops admission, cancels every live transfer and waits for worker tasks.
    ///
    /// Partial files are left for the next [`Scheduler::sweep_partials`].
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            for transfer in state.transfers.values() {
                transfer.generation_token.cancel();
            }
            state.transfers.clear();
            state.active = 0;
        }
        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!("Scheduler stopped");
    }
}

impl Shared {
    /// Starts queued transfers in enqueue order while slots are free.
    fn admit(&self, state: &mut SchedulerState) {
        if state.closed {
            return;
        }
        while state.active < self.max_concurrent {
            let next = state
                .transfers
                .values()
                .filter(|t| t.state == TransferState::Queued)
                .min_by_key(|t| t.seq)
                .map(|t| t.job.video_id.clone());
            match next {
                Some(video_id) => self.start_run(state, &video_id),
                None => break,
            }
        }
    }

    fn start_run(&self, state: &mut SchedulerState, video_id: &str) {
        let transfer = match state.transfers.get_mut(video_id) {
            Some(transfer) => transfer,
            None => return,
        };
        transfer.transition(TransferState::Active);
        transfer.job.attempt += 1;

        let cancel = transfer.generation_token.child_token();
        transfer.run_token = Some(cancel.clone());
        // A paused run may still be unwinding; the next one waits for it.
        let previous = transfer.run_handle.take();
        let job = transfer.job.clone();
        let downloader = self.downloader.clone();
        let events = self.events_tx.clone();
        let reporter = ProgressReporter::new(&job, events.clone());

        info!(
            "Starting {} (generation {}, attempt {}) with {}",
            job.video_id,
            job.generation,
            job.attempt,
            downloader.get_name()
        );
        transfer.run_handle = Some(self.tracker.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = downloader.download(&job, reporter, cancel).await;
            let _ = events.send(TransferEvent::Finished {
                video_id: job.video_id.clone(),
                generation: job.generation,
                attempt: job.attempt,
                result,
            });
        }));
        state.active += 1;
    }

    async fn handle(&self, event: TransferEvent) {
        match event {
            TransferEvent::Progress { video_id, generation, attempt, fraction } => {
                let mut state = self.state.lock().await;
                if let Some(transfer) = state.transfers.get_mut(&video_id) {
                    if transfer.is_current(generation, attempt) && transfer.state == TransferState::Active {
                        self.record_progress(transfer, fraction);
                    }
                }
            }
            TransferEvent::Finished { video_id, generation, attempt, result } => {
                self.finish(&video_id, generation, attempt, result).await;
            }
        }
    }

    /// Forwards progress only when it rises, so observers never see it go back.
    fn record_progress(&self, transfer: &mut Transfer, fraction: f64) {
        if fraction > transfer.progress {
            transfer.progress = fraction;
        }
        let percent = transfer.progress * 100.0;
        let due = match transfer.reported_percent {
            None => true,
            Some(last) => percent > last && (percent - last >= self.progress_step || percent >= 100.0),
        };
        if due {
            transfer.reported_percent = Some(percent);
            self.hub
                .progress(&transfer.job.video_id, percent, &transfer.generation_token);
        }
    }

    async fn finish(
        &self,
        video_id: &str,
        generation: u64,
        attempt: u32,
        result: std::result::Result<PathBuf, DownloadError>,
    ) {
        let mut state = self.state.lock().await;
        let current = state.transfers.get(video_id).map_or(false, |t| {
            t.is_current(generation, attempt) && t.state == TransferState::Active
        });
        if !current {
            debug!(
                "Ignoring result of {} generation {} attempt {}: no longer running",
                video_id, generation, attempt
            );
            return;
        }
        let mut transfer = match state.transfers.remove(video_id) {
            Some(transfer) => transfer,
            None => return,
        };
        state.active -= 1;

        let outcome = match result {
            Ok(path) => self.commit(&transfer, &path).await,
            Err(DownloadError::Cancelled) => {
                Err(DownloadError::Network("transfer was interrupted".to_string()))
            }
            Err(error) => Err(error),
        };

        match outcome {
            Ok(()) => {
                if transfer.reported_percent.map_or(true, |p| p < 100.0) {
                    transfer.reported_percent = Some(100.0);
                    self.hub.progress(video_id, 100.0, &transfer.generation_token);
                }
                transfer.transition(TransferState::Completed);
                info!("Completed {}", video_id);
                self.hub.complete(video_id, &transfer.generation_token);
            }
            Err(error) => {
                transfer.transition(TransferState::Failed);
                warn!("Download of {} failed: {}", video_id, error);
                self.hub.error(video_id, error, &transfer.generation_token);
            }
        }

        let downloader = self.downloader.clone();
        let job = transfer.job;
        self.tracker.spawn(async move {
            if let Err(e) = downloader.discard(&job).await {
                warn!("Failed to discard partial data for {}: {}", job.video_id, e);
            }
        });

        self.admit(&mut state);
    }

    /// Verifies the finished file and hands it to the catalog.
    async fn commit(&self, transfer: &Transfer, path: &Path) -> std::result::Result<(), DownloadError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            DownloadError::Storage(format!("finished file {:?} is unreadable: {}", path, e))
        })?;
        if !metadata.is_file() || metadata.len() == 0 {
            return Err(DownloadError::Storage(format!("finished file {:?} is empty", path)));
        }

        let job = &transfer.job;
        self.catalog
            .commit(&job.video_id, path, &job.extension, job.metadata.clone())
            .await
            .map(|_| ())
            .map_err(|e| DownloadError::Storage(e.to_string()))
    }
}

async fn event_loop(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<TransferEvent>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => shared.handle(event).await,
                None => break,
            },
        }
    }
    debug!("Scheduler event loop finished");
}

fn describe_partial(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .and_then(video_id_from_stem)
        .unwrap_or_else(|| path.display().to_string())
}
