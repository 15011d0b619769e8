//! Mock network endpoints for testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;

use super::stream::{ChannelStream, StreamChunk};
use super::traits::{DownloadError, FetchError, ManifestFetcher, StreamingDownloader};
use crate::manifest::{FirmwareManifest, ReleasePattern};

/// Scripted image response.
enum ImageResponse {
    /// Body delivered in chunks, then closed.
    Scripted {
        chunks: Vec<StreamChunk>,
        declared: Option<u64>,
    },
    /// Body fed by the test through a [`LiveFeed`].
    Live {
        receiver: mpsc::Receiver<StreamChunk>,
        declared: Option<u64>,
    },
    /// Probe and open both fail.
    Error(DownloadError),
}

/// Producer half of a live mock image stream.
///
/// Dropping the feed ends the stream cleanly.
pub struct LiveFeed {
    sender: Sender<StreamChunk>,
}

impl LiveFeed {
    /// Deliver one chunk to the stream.
    pub fn send(&self, chunk: &[u8]) {
        let _ = self.sender.send(Ok(chunk.to_vec()));
    }

    /// End the stream with an error.
    pub fn fail(self, error: DownloadError) {
        let _ = self.sender.send(Err(error));
    }
}

/// Mock manifest and image endpoints for unit testing orchestration logic.
pub struct MockNetwork {
    pattern: ReleasePattern,
    /// Manifest body or error.
    manifest: Mutex<Result<Vec<u8>, FetchError>>,
    /// Image response, consumed by the first `open`.
    image: Mutex<Option<ImageResponse>>,
    /// Captured image URLs (probe and open).
    requested_urls: Mutex<Vec<String>>,
    manifest_fetches: AtomicUsize,
    probes: AtomicUsize,
    opened_streams: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::with_pattern(ReleasePattern::default())
    }

    /// Use a custom release pattern for derived image URLs.
    pub fn with_pattern(pattern: ReleasePattern) -> Self {
        Self {
            pattern,
            manifest: Mutex::new(Err(FetchError::Network("no manifest scripted".into()))),
            image: Mutex::new(None),
            requested_urls: Mutex::new(Vec::new()),
            manifest_fetches: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            opened_streams: AtomicUsize::new(0),
        }
    }

    /// Serve `json` as the manifest body.
    pub fn set_manifest_json(&self, json: &str) {
        *self.manifest.lock().unwrap() = Ok(json.as_bytes().to_vec());
    }

    /// Fail manifest requests with `error`.
    pub fn fail_manifest(&self, error: FetchError) {
        *self.manifest.lock().unwrap() = Err(error);
    }

    /// Serve `data` in `chunk_size` pieces with a matching Content-Length.
    pub fn set_image(&self, data: &[u8], chunk_size: usize) {
        self.set_image_with_length(data, chunk_size, Some(data.len() as u64));
    }

    /// Serve `data` in `chunk_size` pieces, declaring `declared` as its length.
    pub fn set_image_with_length(&self, data: &[u8], chunk_size: usize, declared: Option<u64>) {
        let chunks = data
            .chunks(chunk_size.max(1))
            .map(|c| Ok(c.to_vec()))
            .collect();
        *self.image.lock().unwrap() = Some(ImageResponse::Scripted { chunks, declared });
    }

    /// Serve `data`, then break the connection.
    pub fn set_image_then_fail(&self, data: &[u8], chunk_size: usize, error: DownloadError) {
        let mut chunks: Vec<StreamChunk> = data
            .chunks(chunk_size.max(1))
            .map(|c| Ok(c.to_vec()))
            .collect();
        chunks.push(Err(error));
        *self.image.lock().unwrap() = Some(ImageResponse::Scripted {
            chunks,
            declared: Some(data.len() as u64 + 1),
        });
    }

    /// Serve an image whose chunks are pushed by the test.
    pub fn set_live_image(&self, declared: Option<u64>) -> LiveFeed {
        let (sender, receiver) = mpsc::channel();
        *self.image.lock().unwrap() = Some(ImageResponse::Live { receiver, declared });
        LiveFeed { sender }
    }

    /// Fail probe and open with `error`.
    pub fn fail_image(&self, error: DownloadError) {
        *self.image.lock().unwrap() = Some(ImageResponse::Error(error));
    }

    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn opened_streams(&self) -> usize {
        self.opened_streams.load(Ordering::SeqCst)
    }

    /// Image URLs requested so far.
    pub fn requested_urls(&self) -> Vec<String> {
        self.requested_urls.lock().unwrap().clone()
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl ManifestFetcher for MockNetwork {
    fn fetch(&self, _url: &str) -> Result<FirmwareManifest, FetchError> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        let body = self.manifest.lock().unwrap().clone()?;
        FirmwareManifest::parse(&body, &self.pattern)
    }
}

impl StreamingDownloader for MockNetwork {
    type Stream = ChannelStream;

    fn probe(&self, url: &str) -> Result<Option<u64>, DownloadError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.requested_urls.lock().unwrap().push(url.to_string());
        match self.image.lock().unwrap().as_ref() {
            Some(ImageResponse::Scripted { declared, .. })
            | Some(ImageResponse::Live { declared, .. }) => Ok(*declared),
            Some(ImageResponse::Error(e)) => Err(e.clone()),
            None => Err(DownloadError::HttpStatus { status: 404 }),
        }
    }

    fn open(&self, url: &str) -> Result<ChannelStream, DownloadError> {
        self.requested_urls.lock().unwrap().push(url.to_string());
        let response = self
            .image
            .lock()
            .unwrap()
            .take()
            .ok_or(DownloadError::HttpStatus { status: 404 })?;

        match response {
            ImageResponse::Scripted { chunks, declared } => {
                self.opened_streams.fetch_add(1, Ordering::SeqCst);
                let (sender, receiver) = mpsc::channel();
                for chunk in chunks {
                    let _ = sender.send(chunk);
                }
                Ok(ChannelStream::new(receiver, declared))
            }
            ImageResponse::Live { receiver, declared } => {
                self.opened_streams.fetch_add(1, Ordering::SeqCst);
                Ok(ChannelStream::new(receiver, declared))
            }
            ImageResponse::Error(e) => Err(e),
        }
    }
}
