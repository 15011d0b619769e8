//! Update orchestrator - high-level driver for one update attempt.
//!
//! Sequences manifest check, version gate, flash reservation, streaming
//! download and commit, and reports every step to a [`ProgressSink`].
//! Images pushed by the user go through the same flash session.
//! At most one attempt runs at a time; a concurrent call is rejected.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, UpdateConfig};
use crate::device::DeviceControl;
use crate::events::{NullSink, Progress, ProgressSink};
use crate::flash::{
    BeginError, CommitError, FlashBackend, FlashWriteSession, UpdateTarget, WriteError,
};
use crate::state::{DownloadTracker, PhaseMachine, UpdatePhase};
use crate::transport::{ByteStream, DownloadError, FetchError, ManifestFetcher, StreamingDownloader};
use crate::version::is_newer;

/// Why an update attempt did not complete.
///
/// The `Display` text is the reason handed to the progress sink.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("An update is already in progress")]
    Busy,

    #[error("Update installed, waiting for restart")]
    RestartPending,

    #[error("Manifest check failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Cannot start flash write: {0}")]
    Begin(#[from] BeginError),

    #[error("Flash write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("Reading image failed: {0}")]
    Read(#[from] std::io::Error),
}

/// Result of a completed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Remote version is not newer; nothing was downloaded.
    UpToDate { version: String },
    /// New image committed; the device restarts shortly.
    RebootPending {
        version: String,
        target: UpdateTarget,
        bytes: u64,
    },
}

/// Image written by [`UpdateOrchestrator::install_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledImage {
    pub target: UpdateTarget,
    pub bytes: u64,
}

/// Clears the busy flag when an attempt ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives update attempts against one network and one flash backend.
pub struct UpdateOrchestrator<N, F>
where
    N: ManifestFetcher + StreamingDownloader,
    F: FlashBackend,
{
    config: UpdateConfig,
    local_version: String,
    network: N,
    flash: Mutex<F>,
    device: Arc<dyn DeviceControl>,
    sink: Arc<dyn ProgressSink>,
    busy: AtomicBool,
    machine: Mutex<PhaseMachine>,
}

impl<N, F> UpdateOrchestrator<N, F>
where
    N: ManifestFetcher + StreamingDownloader,
    F: FlashBackend,
{
    /// Rejects a configuration that [`UpdateConfig::validate`] refuses.
    pub fn new(
        config: UpdateConfig,
        local_version: &str,
        network: N,
        flash: F,
        device: Arc<dyn DeviceControl>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            local_version: local_version.to_string(),
            network,
            flash: Mutex::new(flash),
            device,
            sink: Arc::new(NullSink),
            busy: AtomicBool::new(false),
            machine: Mutex::new(PhaseMachine::new()),
        })
    }

    /// Report progress to `sink` instead of discarding it.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn local_version(&self) -> &str {
        &self.local_version
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Current phase of the latest attempt.
    pub fn phase(&self) -> UpdatePhase {
        self.machine().phase().clone()
    }

    /// Whether an attempt is running right now.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run one update attempt.
    ///
    /// Returns [`UpdateError::Busy`] without side effects if another attempt
    /// is running, and [`UpdateError::RestartPending`] once an image has been
    /// committed.
    #[instrument(skip(self), fields(local = %self.local_version))]
    pub fn check_for_update(&self) -> Result<UpdateOutcome, UpdateError> {
        let _busy = self.start_attempt()?;

        let result = self.run_attempt();
        match &result {
            Ok(UpdateOutcome::UpToDate { version }) => {
                self.sink
                    .on_terminal(true, Some(&format!("Already latest ({})", version)));
            }
            Ok(UpdateOutcome::RebootPending { version, .. }) => {
                self.sink
                    .on_terminal(true, Some(&format!("Updated to {}, restarting", version)));
            }
            Err(e) => self.fail(e),
        }
        result
    }

    /// Write an image read from `reader` and restart into it.
    ///
    /// `name` picks the partition the way a release asset name does. Without
    /// a `size` the whole partition is reserved and any non-empty image is
    /// accepted. Busy and restart-pending rules match [`check_for_update`].
    ///
    /// [`check_for_update`]: UpdateOrchestrator::check_for_update
    #[instrument(skip(self, reader))]
    pub fn install_image<R: Read>(
        &self,
        name: &str,
        size: Option<u64>,
        reader: R,
    ) -> Result<InstalledImage, UpdateError> {
        let _busy = self.start_attempt()?;

        let result = self.run_install(name, size, reader);
        match &result {
            Ok(_) => self
                .sink
                .on_terminal(true, Some(&format!("Installed {}, restarting", name))),
            Err(e) => self.fail(e),
        }
        result
    }

    /// Claim the single attempt slot.
    fn start_attempt(&self) -> Result<BusyGuard<'_>, UpdateError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Update rejected, another attempt is running");
            return Err(UpdateError::Busy);
        }
        let busy = BusyGuard(&self.busy);

        if self.phase() == UpdatePhase::RebootPending {
            debug!("Update skipped, restart pending");
            return Err(UpdateError::RestartPending);
        }
        Ok(busy)
    }

    fn fail(&self, error: &UpdateError) {
        let reason = error.to_string();
        warn!(reason = %reason, "Update attempt failed");
        self.goto(UpdatePhase::Failed(reason.clone()));
        self.sink.on_terminal(false, Some(&reason));
    }

    fn run_attempt(&self) -> Result<UpdateOutcome, UpdateError> {
        self.goto(UpdatePhase::CheckingManifest);
        self.sink.on_status("Checking for updates");
        let manifest = self.network.fetch(&self.config.manifest_url)?;

        self.goto(UpdatePhase::ComparingVersion);
        if !is_newer(&manifest.version, &self.local_version) {
            info!(remote = %manifest.version, "Firmware is up to date");
            self.goto(UpdatePhase::Idle);
            self.sink.on_status("Already running the latest firmware");
            return Ok(UpdateOutcome::UpToDate {
                version: self.local_version.clone(),
            });
        }

        let target = manifest.target();
        info!(
            remote = %manifest.version,
            partition = %target,
            url = %manifest.binary_url,
            "Update available"
        );
        if !manifest.release_notes.is_empty() {
            debug!(notes = %manifest.release_notes, "Release notes");
        }
        self.sink
            .on_status(&format!("Update available: {}", manifest.version));

        self.goto(UpdatePhase::Downloading);
        let size_hint = self.network.probe(&manifest.binary_url)?;

        let mut flash = self.flash.lock().unwrap_or_else(PoisonError::into_inner);
        let mut session = FlashWriteSession::new(&mut *flash);
        session.begin(target, size_hint)?;

        let mut stream = self.network.open(&manifest.binary_url)?;
        if let Some(total) = stream.content_length() {
            session.declare_total(total)?;
        }

        self.goto(UpdatePhase::Flashing);
        self.sink.on_status("Downloading firmware");
        let tracker = self.pump(&mut stream, &mut session)?;

        self.goto(UpdatePhase::Committing);
        self.sink.on_status("Verifying firmware");
        session.commit()?;
        drop(session);
        drop(flash);

        info!(bytes = tracker.written, chunks = tracker.chunks, "Update committed");
        self.restart();

        Ok(UpdateOutcome::RebootPending {
            version: manifest.version,
            target,
            bytes: tracker.written,
        })
    }

    fn run_install<R: Read>(
        &self,
        name: &str,
        size: Option<u64>,
        mut reader: R,
    ) -> Result<InstalledImage, UpdateError> {
        let target = UpdateTarget::from_filename(name);
        info!(partition = %target, ?size, "Installing uploaded image");
        self.goto(UpdatePhase::Flashing);
        self.sink.on_status(&format!("Installing {}", name));

        let mut flash = self.flash.lock().unwrap_or_else(PoisonError::into_inner);
        let mut session = FlashWriteSession::new(&mut *flash);
        session.begin(target, size)?;

        let mut tracker = DownloadTracker::new(size);
        let mut buf = vec![0u8; self.config.chunk_size];
        loop {
            self.device.feed_watchdog();
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            session.write_chunk(&buf[..n])?;
            tracker.advance(n);
            self.sink
                .on_progress(Progress::from_counts(tracker.written, tracker.total));
        }

        self.goto(UpdatePhase::Committing);
        self.sink.on_status("Verifying firmware");
        session.commit()?;
        drop(session);
        drop(flash);

        info!(bytes = tracker.written, chunks = tracker.chunks, "Upload committed");
        self.restart();

        Ok(InstalledImage {
            target,
            bytes: tracker.written,
        })
    }

    fn restart(&self) {
        self.device
            .schedule_restart(Duration::from_millis(self.config.restart_delay_ms));
        self.goto(UpdatePhase::RebootPending);
        self.sink.on_status("Update complete, restarting");
    }

    /// Move bytes from `stream` into `session` until the stream ends.
    fn pump<S: ByteStream>(
        &self,
        stream: &mut S,
        session: &mut FlashWriteSession<'_, F>,
    ) -> Result<DownloadTracker, UpdateError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let stall_timeout = Duration::from_secs(self.config.stall_timeout_secs);
        let mut tracker = DownloadTracker::new(session.total());
        let mut buf = vec![0u8; self.config.chunk_size];

        loop {
            self.device.feed_watchdog();

            let available = stream.available()?;
            if available == 0 {
                if stream.is_finished() || tracker.is_complete() {
                    break;
                }
                if tracker.is_stalled(stall_timeout) {
                    return Err(DownloadError::Stalled {
                        timeout_ms: stall_timeout.as_millis() as u64,
                    }
                    .into());
                }
                thread::sleep(poll);
                continue;
            }

            let want = available.min(buf.len());
            let n = stream.read(&mut buf[..want])?;
            if n == 0 {
                continue;
            }
            session.write_chunk(&buf[..n])?;
            tracker.advance(n);
            self.sink
                .on_progress(Progress::from_counts(tracker.written, tracker.total));
        }

        debug!(
            written = tracker.written,
            total = ?tracker.total,
            "Stream ended"
        );
        Ok(tracker)
    }

    fn machine(&self) -> MutexGuard<'_, PhaseMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn goto(&self, next: UpdatePhase) {
        self.machine().goto(next);
    }
}
