//! reqwest-based HTTP transport implementation.

use std::io::{ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_LENGTH;
use reqwest::redirect::Policy;
use tracing::{debug, info, instrument, warn};

use super::stream::{ChannelStream, StreamChunk};
use super::traits::{DownloadError, FetchError, ManifestFetcher, StreamingDownloader};
use crate::config::UpdateConfig;
use crate::manifest::{FirmwareManifest, ReleasePattern};

/// Release assets are served through a redirect chain (release page, CDN).
const MAX_REDIRECTS: usize = 10;

const USER_AGENT: &str = concat!("hsota/", env!("CARGO_PKG_VERSION"));

/// Blocking HTTP(S) transport for the manifest and image endpoints.
pub struct HttpTransport {
    /// Short overall timeout, for the manifest.
    manifest_client: Client,
    /// Connect timeout, plus a per-read timeout so a silent socket
    /// releases the body reader thread.
    download_client: Client,
    pattern: ReleasePattern,
    chunk_size: usize,
}

impl HttpTransport {
    /// Build both clients from the update configuration.
    pub fn new(config: &UpdateConfig) -> reqwest::Result<Self> {
        let manifest_client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.manifest_timeout_secs))
            .build()?;

        let download_client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.stall_timeout_secs))
            .build()?;

        Ok(Self {
            manifest_client,
            download_client,
            pattern: config.release.clone(),
            chunk_size: config.chunk_size,
        })
    }
}

impl ManifestFetcher for HttpTransport {
    #[instrument(skip(self))]
    fn fetch(&self, url: &str) -> Result<FirmwareManifest, FetchError> {
        let response = self
            .manifest_client
            .get(url)
            .send()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        debug!(bytes = body.len(), "Manifest received");

        FirmwareManifest::parse(&body, &self.pattern)
    }
}

impl StreamingDownloader for HttpTransport {
    type Stream = ChannelStream;

    #[instrument(skip(self))]
    fn probe(&self, url: &str) -> Result<Option<u64>, DownloadError> {
        let response = self
            .download_client
            .head(url)
            .send()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(declared_length(&response)),
            // Some asset hosts refuse HEAD; size is then learned from the body.
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
                warn!(status = %response.status(), "HEAD not supported, size unknown");
                Ok(None)
            }
            status => Err(DownloadError::HttpStatus {
                status: status.as_u16(),
            }),
        }
    }

    #[instrument(skip(self))]
    fn open(&self, url: &str) -> Result<ChannelStream, DownloadError> {
        let response = self
            .download_client
            .get(url)
            .send()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let content_length = declared_length(&response);
        info!(final_url = %response.url(), ?content_length, "Image stream opened");

        // Zero capacity: the reader hands over one chunk at a time.
        let (sender, receiver) = mpsc::sync_channel(0);
        let (recycle, recycled) = mpsc::channel();
        let chunk_size = self.chunk_size;
        thread::Builder::new()
            .name("hsota-download".into())
            .spawn(move || pump_body(response, chunk_size, sender, recycled))
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        Ok(ChannelStream::new(receiver, content_length).with_recycler(recycle))
    }
}

fn declared_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Read the body until EOF, an error, or the consumer going away.
///
/// Buffers come back from the consumer on `recycled`; a new one is only
/// allocated while none has been returned yet.
fn pump_body<R: Read>(
    mut body: R,
    chunk_size: usize,
    sender: SyncSender<StreamChunk>,
    recycled: Receiver<Vec<u8>>,
) {
    loop {
        let mut chunk = recycled.try_recv().unwrap_or_default();
        chunk.resize(chunk_size, 0);
        match body.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                chunk.truncate(n);
                if sender.send(Ok(chunk)).is_err() {
                    debug!("Stream consumer dropped");
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = sender.send(Err(DownloadError::Network(e.to_string())));
                break;
            }
        }
    }
}
