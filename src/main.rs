use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use video_downloader::{
    AppConfig, DownloadError, DownloadManager, DownloadObserver, DrmInfo, EnqueueOutcome,
    PlaybackConfig, VideoDownloadable, VideoMetadata,
};

#[derive(Parser)]
#[command(name = "video-downloader")]
#[command(version, about = "Download videos for offline playback")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file (defaults to the per-user config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Download a video and wait for it to finish
    Download {
        video_id: String,
        url: String,
        #[arg(long)]
        title: Option<String>,
        /// DRM scheme of a protected asset, e.g. widevine
        #[arg(long)]
        drm_scheme: Option<String>,
        #[arg(long, requires = "drm_scheme")]
        license_url: Option<String>,
    },
    /// List completed downloads
    List,
    /// Print where a video is stored, or how it would be played
    Locate { video_id: String },
    /// Delete a completed download
    Delete { video_id: String },
    /// Delete every completed download
    Clear,
    /// Repair the catalog and remove leftovers from interrupted transfers
    Restore,
}

/// Drives a progress bar for one video and reports how its transfer ended.
struct CliObserver {
    video_id: String,
    bar: ProgressBar,
    done: Mutex<Option<oneshot::Sender<Result<(), DownloadError>>>>,
}

impl CliObserver {
    fn new(video_id: &str) -> (Arc<Self>, oneshot::Receiver<Result<(), DownloadError>>) {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} [{bar:40}] {pos:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(video_id.to_string());
        let (tx, rx) = oneshot::channel();
        let observer = Arc::new(Self {
            video_id: video_id.to_string(),
            bar,
            done: Mutex::new(Some(tx)),
        });
        (observer, rx)
    }

    fn finish(&self, outcome: Result<(), DownloadError>) {
        let sender = match self.done.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

impl DownloadObserver for CliObserver {
    fn on_progress(&self, video_id: &str, percent: f64) {
        if video_id == self.video_id {
            self.bar.set_position(percent.round() as u64);
        }
    }

    fn on_error(&self, video_id: &str, error: &DownloadError) {
        if video_id == self.video_id {
            self.bar.abandon_with_message(format!("{} failed", video_id));
            self.finish(Err(error.clone()));
        }
    }

    fn on_complete(&self, video_id: &str) {
        if video_id == self.video_id {
            self.bar.finish_with_message(format!("{} done", video_id));
            self.finish(Ok(()));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!("Using storage directory {:?}", config.storage_dir);

    let manager = DownloadManager::new(config).await?;
    let result = run(&manager, cli.command).await;
    manager.shutdown().await;
    result
}

async fn run(manager: &DownloadManager, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Download { video_id, url, title, drm_scheme, license_url } => {
            let metadata = VideoMetadata {
                title,
                drm: drm_scheme.map(|scheme| DrmInfo { scheme, license_url, key_id: None }),
                ..VideoMetadata::default()
            };
            download(manager, &video_id, &url, metadata).await?;
        }
        Command::List => {
            let records = manager.records().await;
            if records.is_empty() {
                println!("No downloads");
            }
            for record in records {
                let title = record
                    .metadata
                    .as_ref()
                    .and_then(|m| m.title.as_deref())
                    .unwrap_or("-");
                println!(
                    "{}\t{}\t{}\t{}",
                    record.video_id,
                    title,
                    record.size_bytes.map_or_else(|| "?".to_string(), |size| size.to_string()),
                    record.local_path.display()
                );
            }
        }
        Command::Locate { video_id } => {
            let playback =
                PlaybackConfig::resolve(manager, &video_id, &manager.config().share_base_url).await?;
            match &playback.local_playback_path {
                Some(path) => println!("{}", path.display()),
                None => println!("not downloaded; stream from {}", playback.share_link()),
            }
        }
        Command::Delete { video_id } => {
            if !manager.delete(&video_id).await {
                bail!("{} is not downloaded", video_id);
            }
            println!("Deleted {}", video_id);
        }
        Command::Clear => {
            let report = manager.clear().await;
            println!(
                "Removed {}, already missing {}, failed {}",
                report.removed.len(),
                report.missing.len(),
                report.failed.len()
            );
            for (video_id, reason) in &report.failed {
                eprintln!("  {}: {}", video_id, reason);
            }
            if let Some(error) = report.index_error {
                bail!("index could not be written: {}", error);
            }
        }
        Command::Restore => {
            let report = manager.restore().await?;
            if report.catalog.index_recovered {
                eprintln!(
                    "index was unreadable; {} downloads recovered from file names",
                    report.catalog.rebuilt.len()
                );
            }
            println!(
                "{} downloads, {} stale records dropped, {} orphan files and {} partial files removed",
                report.catalog.kept(),
                report.catalog.dropped.len(),
                report.catalog.orphans_removed,
                report.partials_removed
            );
        }
    }
    Ok(())
}

async fn download(
    manager: &DownloadManager,
    video_id: &str,
    url: &str,
    metadata: VideoMetadata,
) -> anyhow::Result<()> {
    let (observer, finished) = CliObserver::new(video_id);
    let handle: Arc<dyn DownloadObserver> = observer.clone();
    manager.add(&handle).await;

    match manager.enqueue_download_with_metadata(video_id, url, Some(metadata)).await? {
        EnqueueOutcome::Queued => {}
        EnqueueOutcome::AlreadyDownloaded => {
            observer.bar.finish_and_clear();
            if let Some(path) = manager.get_location(video_id).await {
                println!("Already downloaded: {}", path.display());
            }
            return Ok(());
        }
        EnqueueOutcome::Duplicate(state) => bail!("{} is already {:?}", video_id, state),
    }

    tokio::select! {
        outcome = finished => match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => bail!("Download of {} failed: {}", video_id, error),
            Err(_) => bail!("Download of {} ended without a result", video_id),
        },
        _ = tokio::signal::ctrl_c() => {
            observer.bar.abandon_with_message("interrupted");
            manager.dequeue_download(video_id).await;
            bail!("Download of {} interrupted", video_id);
        }
    }

    match manager.get_location(video_id).await {
        Some(path) => println!("{}", path.display()),
        None => bail!("{} completed but is missing from the catalog", video_id),
    }
    Ok(())
}
