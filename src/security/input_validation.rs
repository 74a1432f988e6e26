use crate::errors::{AppError, Result};
use url::Url;

/// Files are named after the hex of the id, so the stem is twice this long.
/// With a `.<generation>.part` suffix the name must still fit in 255 bytes.
pub const MAX_VIDEO_ID_LEN: usize = 100;

pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_video_id(&self, video_id: &str) -> Result<()> {
        if video_id.trim().is_empty() {
            return Err(AppError::Validation("Video id cannot be empty".to_string()));
        }

        if video_id.len() > MAX_VIDEO_ID_LEN {
            return Err(AppError::Validation(format!(
                "Video id too long (max {} bytes)",
                MAX_VIDEO_ID_LEN
            )));
        }

        if video_id.chars().any(|c| c.is_control()) {
            return Err(AppError::Validation("Control characters not allowed in video id".to_string()));
        }

        Ok(())
    }

    /// Parses a source URL, accepting only http(s) with a host.
    pub fn validate_source_url(&self, url: &str) -> Result<Url> {
        if url.is_empty() {
            return Err(AppError::Validation("URL cannot be empty".to_string()));
        }

        let parsed_url = Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

        if !matches!(parsed_url.scheme(), "http" | "https") {
            return Err(AppError::Validation(format!(
                "Unsupported scheme: {}. Only http and https sources can be downloaded",
                parsed_url.scheme()
            )));
        }

        if parsed_url.host_str().map_or(true, str::is_empty) {
            return Err(AppError::Validation("URL must have a host".to_string()));
        }

        Ok(parsed_url)
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_ids_are_checked() {
        let validator = InputValidator::new();
        assert!(validator.validate_video_id("b6f8a2c1-video").is_ok());
        assert!(validator.validate_video_id("   ").is_err());
        assert!(validator.validate_video_id("line\nbreak").is_err());
        assert!(validator.validate_video_id(&"x".repeat(MAX_VIDEO_ID_LEN + 1)).is_err());
    }

    #[test]
    fn longest_id_still_fits_a_file_name() {
        let validator = InputValidator::new();
        let longest = "x".repeat(MAX_VIDEO_ID_LEN);
        assert!(validator.validate_video_id(&longest).is_ok());

        let partial = format!("{}.{}.part", crate::utils::media_file_stem(&longest), u64::MAX);
        assert!(partial.len() <= 255);
    }

    #[test]
    fn only_http_sources_are_accepted() {
        let validator = InputValidator::new();
        let url = validator
            .validate_source_url("https://cdn.example.com/master.m3u8")
            .expect("https accepted");
        assert_eq!(url.host_str(), Some("cdn.example.com"));

        assert!(validator.validate_source_url("").is_err());
        assert!(validator.validate_source_url("file:///etc/passwd").is_err());
        assert!(validator.validate_source_url("not a url").is_err());
    }
}
