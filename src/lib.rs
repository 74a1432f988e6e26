pub mod config;
pub mod downloader;
pub mod errors;
pub mod metadata;
pub mod playback;
pub mod security;
pub mod utils;

pub use config::{AppConfig, NetworkConfig};
pub use downloader::{
    ClearReport, DownloadEvent, DownloadManager, DownloadObserver, DownloadRecord, EnqueueOutcome,
    RestoreReport, TransferSnapshot, TransferState, VideoDownloadable,
};
pub use errors::{AppError, DownloadError, Result};
pub use metadata::{DrmInfo, VideoMetadata};
pub use playback::PlaybackConfig;
