use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use dirs;
use crate::errors::{AppError, Result};

const ENV_PREFIX: &str = "VIDEO_DL";
const INDEX_FILE: &str = "downloads.json";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory for media files, partial transfers and the catalog index.
    pub storage_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    /// Smallest rise in percent that is forwarded to observers.
    pub progress_step_percent: f64,
    /// Deliver `on_cancelled` to observers when a transfer is dequeued.
    pub notify_cancelled: bool,
    pub share_base_url: String,
    pub network: NetworkConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: u64,
    /// A transfer fails when no bytes arrive for this long.
    pub stall_timeout_secs: u64,
    pub user_agent: String,
    pub proxy: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_dir: dirs::data_dir()
                .map(|dir| dir.join("video-downloader"))
                .unwrap_or_else(|| PathBuf::from("./video-downloader")),
            max_concurrent_downloads: 2,
            progress_step_percent: 1.0,
            notify_cancelled: false,
            share_base_url: "https://kinescope.io".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            stall_timeout_secs: 30,
            user_agent: format!("video-downloader/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

impl AppConfig {
    /// Config rooted at `storage_dir` with everything else defaulted.
    pub fn with_storage_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    /// Loads the optional JSON file at `path`, then applies `VIDEO_DL_*` environment overrides.
    ///
    /// Nested keys use a double underscore, e.g. `VIDEO_DL_NETWORK__STALL_TIMEOUT_SECS=60`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(config_dir) = path.parent() {
            if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(AppError::Validation(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if !self.progress_step_percent.is_finite() || self.progress_step_percent < 0.0 {
            return Err(AppError::Validation(format!(
                "progress_step_percent must be a non-negative number, got {}",
                self.progress_step_percent
            )));
        }
        Ok(())
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config(config::ConfigError::Message("Could not find config directory".to_string())))?;

        Ok(config_dir.join("video-downloader").join("config.json"))
    }

    pub fn media_dir(&self) -> PathBuf {
        self.storage_dir.join("media")
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.storage_dir.join("partial")
    }

    pub fn index_path(&self) -> PathBuf {
        self.storage_dir.join(INDEX_FILE)
    }
}
