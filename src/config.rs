use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ROOT_ENV: &str = "SCRIPTSYNC_ROOT";
pub const STATE_DIR: &str = ".scriptsync";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    pub path: Option<String>,
    pub http_port: u16,
    pub channel_port: u16,
    pub bind_address: String,
    pub watch_files: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            path: None,
            http_port: 1977,
            channel_port: 1978,
            bind_address: "127.0.0.1".to_string(),
            watch_files: true,
        }
    }
}

impl SyncSettings {
    pub fn config_path(root: &Path) -> PathBuf {
        root.join(STATE_DIR).join(CONFIG_FILE)
    }

    /// Missing file yields defaults; a broken one is logged and yields defaults.
    pub fn load(root: &Path) -> Self {
        Self::try_load(root).unwrap_or_else(|error| {
            tracing::warn!(error = %error, "settings not loaded, using defaults");
            Self::default()
        })
    }

    /// Missing file yields defaults; unreadable or malformed files are errors.
    pub fn try_load(root: &Path) -> AppResult<Self> {
        let path = Self::config_path(root);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => {
                return Err(AppError::Persistence(format!("{}: {error}", path.display())))
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|error| AppError::MalformedMessage(format!("{}: {error}", path.display())))
    }

    pub fn http_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.http_port)
    }

    pub fn channel_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.channel_port)
    }
}

/// Environment override first, then the configured path, then `fallback`.
pub fn resolve_root(env_value: Option<String>, settings: &SyncSettings, fallback: &Path) -> PathBuf {
    env_value
        .filter(|value| !value.trim().is_empty())
        .or_else(|| settings.path.clone().filter(|value| !value.trim().is_empty()))
        .map(|value| expand_home(&value))
        .unwrap_or_else(|| fallback.to_path_buf())
}

fn expand_home(value: &str) -> PathBuf {
    if value == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(value));
    }
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(value)
}
