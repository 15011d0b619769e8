//! Flash partition abstraction.
//!
//! Defines the `FlashBackend` trait for partition access,
//! allowing different implementations (file, memory, etc.).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Markers in an asset name that select the filesystem partition.
const FILESYSTEM_MARKERS: [&str; 2] = ["littlefs", "spiffs"];

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Partition {target} holds {capacity} bytes, {requested} requested")]
    OutOfSpace {
        target: UpdateTarget,
        requested: u64,
        capacity: u64,
    },

    #[error("No region reserved on {0} partition")]
    NotReserved(UpdateTarget),

    #[error("Image verification failed: {0}")]
    Verify(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flash region addressed by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateTarget {
    /// Application firmware slot.
    ApplicationImage,
    /// Filesystem (LittleFS/SPIFFS) slot.
    FilesystemImage,
}

impl UpdateTarget {
    /// Pick the target from an asset file name.
    pub fn from_filename(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if FILESYSTEM_MARKERS.iter().any(|m| lower.contains(m)) {
            UpdateTarget::FilesystemImage
        } else {
            UpdateTarget::ApplicationImage
        }
    }

    /// Pick the target from the last path segment of an asset URL.
    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let name = path.rsplit('/').next().unwrap_or_default();
        Self::from_filename(name)
    }

    /// Short partition label.
    pub fn label(&self) -> &'static str {
        match self {
            UpdateTarget::ApplicationImage => "app",
            UpdateTarget::FilesystemImage => "spiffs",
        }
    }
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateTarget::ApplicationImage => write!(f, "application"),
            UpdateTarget::FilesystemImage => write!(f, "filesystem"),
        }
    }
}

/// Abstract flash partition interface.
///
/// Writes are sequential appends into a previously reserved region. A
/// region only becomes visible to the bootloader after `finalize`.
pub trait FlashBackend: Send {
    /// Size of the partition backing `target`.
    fn capacity(&self, target: UpdateTarget) -> u64;

    /// Prepare (erase) `size` bytes at the start of the partition.
    fn reserve(&mut self, target: UpdateTarget, size: u64) -> Result<(), FlashError>;

    /// Write `data` at `offset` and return how many bytes were stored.
    fn write(&mut self, target: UpdateTarget, offset: u64, data: &[u8])
    -> Result<usize, FlashError>;

    /// Verify the `len` written bytes and make them the active image.
    fn finalize(&mut self, target: UpdateTarget, len: u64) -> Result<(), FlashError>;

    /// Drop the reservation without activating anything.
    fn release(&mut self, target: UpdateTarget);
}
