use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::sync::retry::RetryPolicy;

const APP_DIR_NAME: &str = "drivesync";
const DEFAULT_TARGET_FOLDER_ID: &str = "root";
const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com";
const DEFAULT_OAUTH_BASE_URL: &str = "https://oauth2.googleapis.com";
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_SECS: f64 = 1.0;
const DEFAULT_MAX_BACKOFF_SECS: f64 = 60.0;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    MissingSetting(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("source folder must be an absolute path: {0}")]
    SourceNotAbsolute(PathBuf),
    #[error("data directory is unavailable; set {0} explicitly")]
    MissingDataDir(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub source_folder: Option<PathBuf>,
    pub target_folder_id: String,
    pub state_db: PathBuf,
    pub retry: RetryPolicy,
    pub upload_chunk_bytes: usize,
    pub api_base_url: String,
    pub oauth_base_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_file: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), dirs::home_dir(), dirs::data_dir())
    }

    /// Builds the config from `lookup` instead of the process environment.
    pub fn from_lookup<F>(
        lookup: F,
        home: Option<PathBuf>,
        data_dir: Option<PathBuf>,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let expand = |value: String| match &home {
            Some(home) => expand_with_home(&value, home),
            None => PathBuf::from(value),
        };
        let app_data_path = |name: &'static str, file: &str| -> Result<PathBuf, ConfigError> {
            match read(name) {
                Some(value) => Ok(expand(value)),
                None => data_dir
                    .as_ref()
                    .map(|dir| dir.join(APP_DIR_NAME).join(file))
                    .ok_or(ConfigError::MissingDataDir(name)),
            }
        };

        let max_attempts = read_number(&read, "DRIVESYNC_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        if max_attempts < 1 {
            return Err(invalid("DRIVESYNC_MAX_RETRIES", max_attempts));
        }
        let initial_backoff = read_seconds(
            &read,
            "DRIVESYNC_INITIAL_BACKOFF_SECS",
            DEFAULT_INITIAL_BACKOFF_SECS,
        )?;
        let max_backoff =
            read_seconds(&read, "DRIVESYNC_MAX_BACKOFF_SECS", DEFAULT_MAX_BACKOFF_SECS)?;
        let multiplier = read_number(&read, "DRIVESYNC_BACKOFF_FACTOR", DEFAULT_BACKOFF_FACTOR)?;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(invalid("DRIVESYNC_BACKOFF_FACTOR", multiplier));
        }
        let upload_chunk_bytes = read_number(
            &read,
            "DRIVESYNC_UPLOAD_CHUNK_BYTES",
            DEFAULT_UPLOAD_CHUNK_BYTES,
        )?;
        if upload_chunk_bytes == 0 {
            return Err(invalid("DRIVESYNC_UPLOAD_CHUNK_BYTES", upload_chunk_bytes));
        }

        Ok(Self {
            source_folder: read("DRIVESYNC_SOURCE_FOLDER").map(&expand),
            target_folder_id: read("DRIVESYNC_TARGET_FOLDER_ID")
                .unwrap_or_else(|| DEFAULT_TARGET_FOLDER_ID.to_string()),
            state_db: app_data_path("DRIVESYNC_STATE_DB", "state.db")?,
            retry: RetryPolicy {
                max_attempts,
                initial_backoff,
                max_backoff,
                multiplier,
            },
            upload_chunk_bytes,
            api_base_url: read("DRIVESYNC_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            oauth_base_url: read("DRIVESYNC_OAUTH_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OAUTH_BASE_URL.to_string()),
            client_id: read("DRIVESYNC_CLIENT_ID"),
            client_secret: read("DRIVESYNC_CLIENT_SECRET"),
            access_token: read("DRIVESYNC_ACCESS_TOKEN"),
            refresh_token: read("DRIVESYNC_REFRESH_TOKEN"),
            token_file: app_data_path("DRIVESYNC_TOKEN_FILE", "token.json")?,
        })
    }

    /// Applies command-line overrides on top of the environment.
    pub fn with_overrides(
        mut self,
        source_folder: Option<PathBuf>,
        target_folder_id: Option<String>,
    ) -> Self {
        if let Some(source_folder) = source_folder {
            self.source_folder = Some(source_folder);
        }
        if let Some(target_folder_id) = target_folder_id.filter(|id| !id.is_empty()) {
            self.target_folder_id = target_folder_id;
        }
        self
    }

    pub fn require_source_folder(&self) -> Result<&Path, ConfigError> {
        let source = self
            .source_folder
            .as_deref()
            .ok_or(ConfigError::MissingSetting("DRIVESYNC_SOURCE_FOLDER"))?;
        if !source.is_absolute() {
            return Err(ConfigError::SourceNotAbsolute(source.to_path_buf()));
        }
        Ok(source)
    }
}

fn invalid(name: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::InvalidNumber {
        name,
        value: value.to_string(),
    }
}

fn read_number<T, R>(read: &R, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    R: Fn(&str) -> Option<String>,
{
    match read(name) {
        Some(value) => value.trim().parse::<T>().map_err(|_| invalid(name, value)),
        None => Ok(default),
    }
}

fn read_seconds<R>(read: &R, name: &'static str, default: f64) -> Result<Duration, ConfigError>
where
    R: Fn(&str) -> Option<String>,
{
    let secs = read_number(read, name, default)?;
    Duration::try_from_secs_f64(secs).map_err(|_| invalid(name, secs))
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
