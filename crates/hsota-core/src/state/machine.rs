//! Update phase tracking.

use std::fmt;
use std::time::{Duration, Instant};

/// Phase of the current update attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdatePhase {
    /// No attempt running.
    #[default]
    Idle,
    /// Fetching the manifest.
    CheckingManifest,
    /// Comparing remote and local versions.
    ComparingVersion,
    /// Sizing the image and opening the stream.
    Downloading,
    /// Pumping chunks into flash.
    Flashing,
    /// Finalizing the written image.
    Committing,
    /// New image committed, waiting for the restart.
    RebootPending,
    /// Attempt failed with a human-readable reason.
    Failed(String),
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdatePhase::Idle => write!(f, "IDLE"),
            UpdatePhase::CheckingManifest => write!(f, "CHECKING_MANIFEST"),
            UpdatePhase::ComparingVersion => write!(f, "COMPARING_VERSION"),
            UpdatePhase::Downloading => write!(f, "DOWNLOADING"),
            UpdatePhase::Flashing => write!(f, "FLASHING"),
            UpdatePhase::Committing => write!(f, "COMMITTING"),
            UpdatePhase::RebootPending => write!(f, "REBOOT_PENDING"),
            UpdatePhase::Failed(_) => write!(f, "FAILED"),
        }
    }
}

impl UpdatePhase {
    /// Whether an attempt is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            UpdatePhase::Idle | UpdatePhase::RebootPending | UpdatePhase::Failed(_)
        )
    }

    /// Whether the orchestrator may move from `self` to `next`.
    pub fn can_transition_to(&self, next: &UpdatePhase) -> bool {
        use UpdatePhase::*;
        match (self, next) {
            (RebootPending, _) => false,
            (_, Failed(_)) => self.is_active(),
            (Idle | Failed(_), CheckingManifest) => true,
            // Uploaded images skip the manifest and the download
            (Idle | Failed(_), Flashing) => true,
            (CheckingManifest, ComparingVersion) => true,
            (ComparingVersion, Idle | Downloading) => true,
            (Downloading, Flashing) => true,
            (Flashing, Committing) => true,
            (Committing, RebootPending) => true,
            _ => false,
        }
    }
}

/// Phase holder that logs every transition.
#[derive(Debug, Default)]
pub struct PhaseMachine {
    phase: UpdatePhase,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &UpdatePhase {
        &self.phase
    }

    /// Transition to a new phase.
    pub fn goto(&mut self, next: UpdatePhase) {
        if !self.phase.can_transition_to(&next) {
            tracing::warn!(from = %self.phase, to = %next, "Unexpected phase transition");
        }
        match &next {
            UpdatePhase::Failed(reason) => {
                tracing::info!(from = %self.phase, to = %next, reason = %reason, "Phase transition")
            }
            _ => tracing::info!(from = %self.phase, to = %next, "Phase transition"),
        }
        self.phase = next;
    }
}

/// Byte accounting and stall detection for one download.
#[derive(Debug)]
pub struct DownloadTracker {
    /// Declared image size, if the server sent one.
    pub total: Option<u64>,
    /// Bytes written to flash so far.
    pub written: u64,
    /// Chunks written so far.
    pub chunks: u64,
    last_data_at: Instant,
}

impl DownloadTracker {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            written: 0,
            chunks: 0,
            last_data_at: Instant::now(),
        }
    }

    pub fn advance(&mut self, len: usize) {
        self.written += len as u64;
        self.chunks += 1;
        self.last_data_at = Instant::now();
    }

    /// Time since the last chunk (or since the download started).
    pub fn idle_for(&self) -> Duration {
        self.last_data_at.elapsed()
    }

    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.idle_for() >= timeout
    }

    /// All declared bytes have been written.
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.written >= total)
    }
}
