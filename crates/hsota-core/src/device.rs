//! Device control hooks used during an update.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Platform services the orchestrator needs around flashing.
pub trait DeviceControl: Send + Sync {
    /// Reset the task watchdog. Called at least once per stream poll.
    fn feed_watchdog(&self);

    /// Restart into the new image after `delay`.
    fn schedule_restart(&self, delay: Duration);
}

/// Host stand-in for the device: records restarts instead of performing them.
#[derive(Default)]
pub struct HostDevice {
    restart_at: Mutex<Option<Instant>>,
    watchdog_feeds: AtomicU64,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a restart has been scheduled.
    pub fn restart_requested(&self) -> bool {
        self.restart_deadline().is_some()
    }

    /// When the scheduled restart is due.
    pub fn restart_deadline(&self) -> Option<Instant> {
        *self
            .restart_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn watchdog_feeds(&self) -> u64 {
        self.watchdog_feeds.load(Ordering::Relaxed)
    }
}

impl DeviceControl for HostDevice {
    fn feed_watchdog(&self) {
        self.watchdog_feeds.fetch_add(1, Ordering::Relaxed);
    }

    fn schedule_restart(&self, delay: Duration) {
        let mut restart_at = self
            .restart_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if restart_at.is_some() {
            warn!("Restart already scheduled");
            return;
        }
        *restart_at = Some(Instant::now() + delay);
        info!(delay_ms = delay.as_millis() as u64, "Restart scheduled");
    }
}
