use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::NetworkConfig;
use crate::downloader::http_pool::HttpPool;
use crate::downloader::{Downloader, ProgressReporter, TransferJob};
use crate::errors::{DownloadError, Result};

/// Progressive HTTP(S) download into the job's partial file, resumable with `Range`.
pub struct HttpDownloader {
    pool: HttpPool,
}

impl HttpDownloader {
    pub fn new(pool: HttpPool) -> Self {
        Self { pool }
    }

    pub fn from_config(network: &NetworkConfig) -> Result<Self> {
        Ok(Self::new(HttpPool::new(network)?))
    }

    async fn resume_offset(job: &TransferJob) -> u64 {
        if !job.is_resumed() {
            return 0;
        }
        tokio::fs::metadata(&job.partial_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        job: &TransferJob,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> std::result::Result<PathBuf, DownloadError> {
        if let Some(parent) = job.partial_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let offset = Self::resume_offset(job).await;
        log::debug!(
            "GET {} for {} (attempt {}, offset {})",
            job.url,
            job.video_id,
            job.attempt,
            offset
        );

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.pool.media_request(&job.url, offset).send() => response?,
        };

        let status = response.status();
        if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            log::info!("{} was already complete before resuming", job.video_id);
            return Ok(job.partial_path.clone());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let reason = format!("HTTP {} for {}", status, job.url);
            return Err(if job.is_protected() {
                DownloadError::Drm(reason)
            } else {
                DownloadError::Network(reason)
            });
        }
        if !status.is_success() {
            return Err(DownloadError::Network(format!("HTTP {} for {}", status, job.url)));
        }
        if let Some(content_type) = response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            if is_playlist(content_type) {
                return Err(DownloadError::Unsupported(format!(
                    "{} is a streaming playlist ({}), not a media file",
                    job.url, content_type
                )));
            }
        }

        let append = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        if offset > 0 && !append {
            log::info!("Server ignored the range request for {}; starting over", job.video_id);
        }
        let mut written = if append { offset } else { 0 };
        let total = response.content_length().map(|remaining| remaining + written);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&job.partial_path)
            .await?;

        let stall = self.pool.stall_timeout();
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(DownloadError::Cancelled);
                }
                next = tokio::time::timeout(stall, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(DownloadError::Network(format!(
                        "no data received for {}s",
                        stall.as_secs()
                    )))
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.report_bytes(written, total);
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(total) = total {
            if written < total {
                return Err(DownloadError::Network(format!(
                    "body ended after {} of {} bytes",
                    written, total
                )));
            }
        }
        if written == 0 {
            return Err(DownloadError::Network(format!("empty response from {}", job.url)));
        }
        progress.report_fraction(1.0);

        Ok(job.partial_path.clone())
    }

    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn get_name(&self) -> &str {
        "http"
    }
}

fn is_playlist(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    mime.eq_ignore_ascii_case("application/vnd.apple.mpegurl")
        || mime.eq_ignore_ascii_case("application/x-mpegurl")
        || mime.eq_ignore_ascii_case("application/dash+xml")
}
