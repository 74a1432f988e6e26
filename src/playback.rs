use std::path::PathBuf;
use url::Url;

use crate::downloader::VideoDownloadable;
use crate::errors::{AppError, Result};

/// How a player should open a video: from disk when it was downloaded, else by id.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    pub video_id: String,
    pub looped: bool,
    pub local_playback_path: Option<PathBuf>,
    share_base_url: Url,
}

impl PlaybackConfig {
    /// Looks the video up in `downloads`, preferring the local copy.
    pub async fn resolve<D>(downloads: &D, video_id: &str, share_base_url: &str) -> Result<Self>
    where
        D: VideoDownloadable + ?Sized,
    {
        let share_base_url = Url::parse(share_base_url)
            .map_err(|e| AppError::Validation(format!("Invalid share base URL: {}", e)))?;
        let local_playback_path = downloads.get_location(video_id).await;
        if let Some(path) = &local_playback_path {
            log::debug!("Playing {} from {:?}", video_id, path);
        }

        Ok(Self {
            video_id: video_id.to_string(),
            looped: false,
            local_playback_path,
            share_base_url,
        })
    }

    pub fn looped(mut self, looped: bool) -> Self {
        self.looped = looped;
        self
    }

    pub fn is_offline(&self) -> bool {
        self.local_playback_path.is_some()
    }

    /// Public link to the video, `<share_base_url>/<video_id>`.
    pub fn share_link(&self) -> Url {
        let mut link = self.share_base_url.clone();
        if let Ok(mut segments) = link.path_segments_mut() {
            segments.pop_if_empty().push(&self.video_id);
        }
        link
    }
}
