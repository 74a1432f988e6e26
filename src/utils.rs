use crate::errors::Result;
use log::info;
use std::path::Path;

/// File stem used for everything stored on behalf of a video.
///
/// Hex keeps distinct ids distinct on disk; replacing reserved characters
/// would map `a/b` and `a_b` to the same name.
pub fn media_file_stem(video_id: &str) -> String {
    hex::encode(video_id.as_bytes())
}

/// Recovers the video id from a stem produced by [`media_file_stem`].
pub fn video_id_from_stem(stem: &str) -> Option<String> {
    let bytes = hex::decode(stem).ok()?;
    String::from_utf8(bytes).ok()
}

/// Container extension taken from the last URL path segment, `mp4` when absent or odd.
pub fn container_extension(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "mp4".to_string())
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Removes a file, treating "already gone" as success.
///
/// Returns `Ok(false)` when there was nothing to delete.
pub async fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_round_trip_and_stay_distinct() {
        let a = media_file_stem("a/b");
        let b = media_file_stem("a_b");
        assert_ne!(a, b);
        assert_eq!(video_id_from_stem(&a).as_deref(), Some("a/b"));
        assert!(video_id_from_stem("not-hex").is_none());
    }

    #[test]
    fn extension_falls_back_to_mp4() {
        let url = url::Url::parse("https://cdn.example.com/v/clip.MKV?token=1").unwrap();
        assert_eq!(container_extension(&url), "mkv");

        let url = url::Url::parse("https://cdn.example.com/v/master").unwrap();
        assert_eq!(container_extension(&url), "mp4");

        let url = url::Url::parse("https://cdn.example.com/v/file.tar-gz-bundle").unwrap();
        assert_eq!(container_extension(&url), "mp4");
    }

    #[tokio::test]
    async fn removing_missing_file_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gone.mp4");
        assert!(!remove_file_if_exists(&path).await.unwrap());

        tokio::fs::write(&path, b"x").await.unwrap();
        assert!(remove_file_if_exists(&path).await.unwrap());
        assert!(!path.exists());
    }
}
