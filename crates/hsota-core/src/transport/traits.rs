//! Network transport abstraction.
//!
//! Defines the manifest and image endpoint traits, allowing different
//! implementations (reqwest, mock, etc.).

use thiserror::Error;

use crate::manifest::FirmwareManifest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Manifest request returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Malformed manifest: {0}")]
    Parse(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Firmware download returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("No data received for {timeout_ms}ms")]
    Stalled { timeout_ms: u64 },
}

/// Manifest endpoint.
pub trait ManifestFetcher: Send + Sync {
    /// GET and parse the manifest at `url`, following redirects.
    fn fetch(&self, url: &str) -> Result<FirmwareManifest, FetchError>;
}

/// Response body of an image download.
///
/// Lazy, finite and non-restartable. Consumers poll [`available`] and only
/// [`read`] what is already there, so the caller never blocks on the network.
///
/// [`available`]: ByteStream::available
/// [`read`]: ByteStream::read
pub trait ByteStream {
    /// Total length declared by the server when the stream was opened.
    fn content_length(&self) -> Option<u64>;

    /// Bytes that can be read right now without blocking.
    fn available(&mut self) -> Result<usize, DownloadError>;

    /// Copy up to `buf.len()` already-available bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DownloadError>;

    /// Whether the body ended cleanly and every byte has been read.
    fn is_finished(&self) -> bool;
}

/// Image endpoint.
pub trait StreamingDownloader: Send + Sync {
    type Stream: ByteStream;

    /// Ask for the image size without opening the body.
    fn probe(&self, url: &str) -> Result<Option<u64>, DownloadError>;

    /// Open the image body as a chunk stream.
    fn open(&self, url: &str) -> Result<Self::Stream, DownloadError>;
}
