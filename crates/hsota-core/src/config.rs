//! Update configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::ReleasePattern;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Host-side flash partition layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// Directory holding the partition files.
    pub root: PathBuf,
    /// Application slot size in bytes.
    pub app_capacity: u64,
    /// Filesystem slot size in bytes.
    pub fs_capacity: u64,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("flash"),
            // min_spiffs layout: 0x1E0000 per app slot, 0x160000 for the filesystem
            app_capacity: 0x1E_0000,
            fs_capacity: 0x16_0000,
        }
    }
}

/// Configuration for update checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Manifest endpoint.
    pub manifest_url: String,
    /// Where release binaries are published.
    pub release: ReleasePattern,
    /// Overall timeout for the manifest request.
    pub manifest_timeout_secs: u64,
    /// Connect timeout for the image request.
    pub connect_timeout_secs: u64,
    /// Abort a download after this long without data.
    pub stall_timeout_secs: u64,
    /// Sleep between polls of an idle stream.
    pub poll_interval_ms: u64,
    /// Flash write unit.
    pub chunk_size: usize,
    /// Delay between commit and restart.
    pub restart_delay_ms: u64,
    /// Period of background checks.
    pub check_interval_secs: u64,
    pub flash: FlashConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: "https://home-sense.vercel.app/api/firmware".to_string(),
            release: ReleasePattern::default(),
            manifest_timeout_secs: 10,
            connect_timeout_secs: 10,
            stall_timeout_secs: 30,
            poll_interval_ms: 20,
            chunk_size: 1024,
            restart_delay_ms: 1000,
            check_interval_secs: 3600,
            flash: FlashConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: UpdateConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.manifest_url.trim().is_empty() {
            return Err(invalid("manifest_url", "must not be empty"));
        }
        let release = &self.release;
        for (field, value) in [
            ("release.host", &release.host),
            ("release.owner", &release.owner),
            ("release.repo", &release.repo),
            ("release.binary_filename", &release.binary_filename),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, "must not be empty"));
            }
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms", "must be at least 1"));
        }
        if self.stall_timeout_secs == 0 {
            return Err(invalid("stall_timeout_secs", "must be at least 1"));
        }
        if self.check_interval_secs == 0 {
            return Err(invalid("check_interval_secs", "must be at least 1"));
        }
        Ok(())
    }
}
