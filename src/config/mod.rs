//! Configuration storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "campus-cli", "campus-cli")
        .context("Could not determine config directory")
}

/// Directory holding `config.toml`.
pub fn config_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().to_path_buf())
}

/// Directory holding persisted credentials.
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server origin, e.g. `https://campus.example.edu`
    pub server: String,
    /// Path prefix of every API endpoint
    pub api_base: String,
    /// Access tokens expiring within this many seconds are refreshed first
    pub refresh_buffer_secs: u64,
    /// Timeout for ordinary API requests
    pub request_timeout_secs: u64,
    /// Timeout for the token refresh call
    pub refresh_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "http://localhost:3000".to_string(),
            api_base: "/api".to_string(),
            refresh_buffer_secs: 30,
            request_timeout_secs: 30,
            refresh_timeout_secs: 15,
        }
    }
}

impl Config {
    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }
}
