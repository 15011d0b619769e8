//! Background update checks.
//!
//! Runs an orchestrator on its own thread: once at start, then every
//! interval, and whenever [`UpdateScheduler::trigger`] is called. Requests
//! made while a check runs are rejected, never queued behind it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::flash::FlashBackend;
use crate::orchestrator::{UpdateError, UpdateOrchestrator, UpdateOutcome};
use crate::transport::{ManifestFetcher, StreamingDownloader};

enum Command {
    CheckNow,
    Shutdown,
}

/// Handle to the background check thread.
pub struct UpdateScheduler {
    sender: Sender<Command>,
    checking: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl UpdateScheduler {
    /// Start checking every `interval`.
    pub fn spawn<N, F>(
        orchestrator: Arc<UpdateOrchestrator<N, F>>,
        interval: Duration,
    ) -> io::Result<Self>
    where
        N: ManifestFetcher + StreamingDownloader + 'static,
        F: FlashBackend + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let checking = Arc::new(AtomicBool::new(false));
        let running = checking.clone();

        let handle = thread::Builder::new()
            .name("hsota-scheduler".into())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "Update scheduler started");
                let mut next_check = Instant::now();
                loop {
                    let timeout = next_check.saturating_duration_since(Instant::now());
                    match receiver.recv_timeout(timeout) {
                        Ok(Command::CheckNow) => debug!("Update check requested"),
                        Err(RecvTimeoutError::Timeout) => debug!("Scheduled update check"),
                        Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    running.store(true, Ordering::Release);
                    let keep_going = run_check(orchestrator.as_ref());
                    let shutdown = discard_queued_checks(&receiver);
                    running.store(false, Ordering::Release);

                    if !keep_going || shutdown {
                        break;
                    }
                    next_check = Instant::now() + interval;
                }
                info!("Update scheduler stopped");
            })?;

        Ok(Self {
            sender,
            checking,
            handle,
        })
    }

    /// Request an immediate check.
    ///
    /// Returns [`UpdateError::Busy`] while a check is running.
    pub fn trigger(&self) -> Result<(), UpdateError> {
        if self.is_checking() {
            warn!("Update check request rejected, an attempt is running");
            return Err(UpdateError::Busy);
        }
        let _ = self.sender.send(Command::CheckNow);
        Ok(())
    }

    /// Whether a check is running on the scheduler thread.
    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::Acquire)
    }

    /// Whether the thread has exited (restart pending or shut down).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the thread and wait for it. A running check completes first.
    pub fn shutdown(self) {
        let _ = self.sender.send(Command::Shutdown);
        self.join();
    }

    /// Wait until the thread stops by itself.
    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("Update scheduler thread panicked");
        }
    }
}

/// Drop check requests that arrived while a check ran. Returns true if a
/// shutdown was among them.
fn discard_queued_checks(receiver: &Receiver<Command>) -> bool {
    let mut shutdown = false;
    while let Ok(command) = receiver.try_recv() {
        match command {
            Command::CheckNow => debug!("Dropping check requested during an attempt"),
            Command::Shutdown => shutdown = true,
        }
    }
    shutdown
}

/// Run one check. Returns false once no further checks make sense.
fn run_check<N, F>(orchestrator: &UpdateOrchestrator<N, F>) -> bool
where
    N: ManifestFetcher + StreamingDownloader,
    F: FlashBackend,
{
    match orchestrator.check_for_update() {
        Ok(UpdateOutcome::RebootPending { version, .. }) => {
            info!(%version, "Update installed, scheduler stopping");
            false
        }
        Ok(UpdateOutcome::UpToDate { .. }) => true,
        Err(UpdateError::RestartPending) => false,
        // Reported through the sink; retried next interval
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpdateConfig;
    use crate::device::HostDevice;
    use crate::flash::MemoryFlash;
    use crate::image::IMAGE_MAGIC;
    use crate::state::UpdatePhase;
    use crate::transport::{DownloadError, MockNetwork};

    type Orchestrator = UpdateOrchestrator<MockNetwork, MemoryFlash>;

    fn orchestrator(network: MockNetwork) -> Arc<Orchestrator> {
        let config = UpdateConfig {
            poll_interval_ms: 1,
            ..UpdateConfig::default()
        };
        Arc::new(
            UpdateOrchestrator::new(
                config,
                "1.0.1",
                network,
                MemoryFlash::new(1 << 20, 1 << 20),
                Arc::new(HostDevice::new()),
            )
            .unwrap(),
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_checks_at_start_and_on_trigger() {
        let network = MockNetwork::new();
        network.set_manifest_json(r#"{"version":"1.0.1"}"#);
        let orchestrator = orchestrator(network);

        let scheduler =
            UpdateScheduler::spawn(orchestrator.clone(), Duration::from_secs(3600)).unwrap();
        wait_until(|| orchestrator.network().manifest_fetches() == 1);
        wait_until(|| !scheduler.is_checking() && !orchestrator.is_busy());

        scheduler.trigger().unwrap();
        wait_until(|| orchestrator.network().manifest_fetches() == 2);

        scheduler.shutdown();
        assert_eq!(orchestrator.network().manifest_fetches(), 2);
    }

    #[test]
    fn test_trigger_during_attempt_is_rejected() {
        let network = MockNetwork::new();
        network.set_manifest_json(r#"{"version":"2.0.0"}"#);
        let feed = network.set_live_image(Some(1000));
        let orchestrator = orchestrator(network);

        let scheduler =
            UpdateScheduler::spawn(orchestrator.clone(), Duration::from_secs(3600)).unwrap();
        wait_until(|| orchestrator.phase() == UpdatePhase::Flashing);

        assert!(scheduler.is_checking());
        assert!(matches!(scheduler.trigger(), Err(UpdateError::Busy)));
        // A request that got past the flag is dropped once the check ends
        scheduler.sender.send(Command::CheckNow).unwrap();

        feed.fail(DownloadError::Network("connection reset".into()));
        wait_until(|| matches!(orchestrator.phase(), UpdatePhase::Failed(_)));
        wait_until(|| !scheduler.is_checking());
        thread::sleep(Duration::from_millis(50));

        assert_eq!(orchestrator.network().manifest_fetches(), 1);
        assert!(!scheduler.is_finished());
        scheduler.shutdown();
    }

    #[test]
    fn test_checks_every_interval() {
        let network = MockNetwork::new();
        network.fail_manifest(crate::transport::FetchError::HttpStatus { status: 503 });
        let orchestrator = orchestrator(network);

        let scheduler =
            UpdateScheduler::spawn(orchestrator.clone(), Duration::from_millis(10)).unwrap();
        wait_until(|| orchestrator.network().manifest_fetches() >= 3);
        assert!(!scheduler.is_finished());
        scheduler.shutdown();
    }

    #[test]
    fn test_stops_after_install() {
        let network = MockNetwork::new();
        network.set_manifest_json(r#"{"version":"2.0.0"}"#);
        let mut image = vec![0u8; 300];
        image[0] = IMAGE_MAGIC;
        network.set_image(&image, 100);
        let orchestrator = orchestrator(network);

        let scheduler =
            UpdateScheduler::spawn(orchestrator.clone(), Duration::from_millis(5)).unwrap();
        scheduler.join();
        assert_eq!(orchestrator.network().manifest_fetches(), 1);
    }
}
