use serde::{Deserialize, Serialize};

/// Descriptive data supplied by the caller at enqueue time and kept with the
/// catalog record so offline lists can be rendered without the network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub duration_secs: Option<u64>,
    pub poster_url: Option<String>,
    pub drm: Option<DrmInfo>,
}

/// Opaque DRM descriptors for a protected asset. Key provisioning itself
/// happens outside this crate; the values are stored so playback can find them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrmInfo {
    pub scheme: String,
    pub license_url: Option<String>,
    pub key_id: Option<String>,
}

impl VideoMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn is_protected(&self) -> bool {
        self.drm.is_some()
    }
}
