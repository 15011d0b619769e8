//! Firmware manifest parsing and release asset URL derivation.
//!
//! The manifest is a small JSON document published next to the releases:
//!
//! ```json
//! { "version": "2.0.0", "description": "Faster PM sampling" }
//! ```

use serde::{Deserialize, Serialize};

use crate::flash::UpdateTarget;
use crate::transport::FetchError;

/// Release asset location, `<host>/<owner>/<repo>/releases/download/v<version>/<binary>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleasePattern {
    /// Release host, e.g. `https://github.com`.
    pub host: String,
    /// Repository owner.
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Asset file name attached to every release.
    pub binary_filename: String,
}

impl Default for ReleasePattern {
    fn default() -> Self {
        Self {
            host: "https://github.com".to_string(),
            owner: "homesense".to_string(),
            repo: "homesense-firmware".to_string(),
            binary_filename: "firmware.bin".to_string(),
        }
    }
}

impl ReleasePattern {
    /// Substitute `version` into the release asset path.
    pub fn binary_url(&self, version: &str) -> String {
        format!(
            "{}/{}/{}/releases/download/v{}/{}",
            self.host.trim_end_matches('/'),
            self.owner,
            self.repo,
            version,
            self.binary_filename
        )
    }
}

/// Parsed manifest for one update check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareManifest {
    /// Published firmware version. May be empty, which never triggers an update.
    pub version: String,
    /// Release notes (`description` field), empty when absent.
    pub release_notes: String,
    /// Image URL derived from `version`.
    pub binary_url: String,
}

#[derive(Deserialize)]
struct RawManifest {
    version: String,
    #[serde(default)]
    description: Option<String>,
}

impl FirmwareManifest {
    /// Parse a manifest body and derive the image URL.
    pub fn parse(body: &[u8], pattern: &ReleasePattern) -> Result<Self, FetchError> {
        let raw: RawManifest =
            serde_json::from_slice(body).map_err(|e| FetchError::Parse(e.to_string()))?;

        Ok(Self {
            binary_url: pattern.binary_url(&raw.version),
            version: raw.version,
            release_notes: raw.description.unwrap_or_default(),
        })
    }

    /// Flash region addressed by this manifest's image.
    pub fn target(&self) -> UpdateTarget {
        UpdateTarget::from_url(&self.binary_url)
    }
}
