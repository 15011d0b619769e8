//! Progress reporting for UI decoupling.
//!
//! The orchestrator reports through a [`ProgressSink`] so the CLI, a display
//! task or a web page can follow an update without touching the core logic.
//! Sinks are called on the update thread and must not block.

use std::fmt;
use std::sync::Mutex;

/// Download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Share of the declared total, 0..=100.
    Percent(u8),
    /// Total unknown; bytes written so far.
    Indeterminate { written: u64 },
}

impl Progress {
    /// Progress for `written` bytes out of an optional `total`.
    pub fn from_counts(written: u64, total: Option<u64>) -> Self {
        match total {
            Some(0) => Progress::Percent(100),
            Some(total) => {
                let pct = u128::from(written.min(total)) * 100 / u128::from(total);
                Progress::Percent(pct as u8)
            }
            None => Progress::Indeterminate { written },
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Percent(pct) => write!(f, "{}%", pct),
            Progress::Indeterminate { written } => write!(f, "{} bytes", written),
        }
    }
}

/// Receiver of update notifications.
///
/// Implement this trait in the UI layer to follow an update.
pub trait ProgressSink: Send + Sync {
    /// Human-readable status line.
    fn on_status(&self, message: &str);

    /// Called after every written chunk.
    fn on_progress(&self, progress: Progress);

    /// Called exactly once per attempt with a short description of the outcome.
    fn on_terminal(&self, success: bool, reason: Option<&str>);
}

/// No-op sink that discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_status(&self, _message: &str) {}

    fn on_progress(&self, _progress: Progress) {}

    fn on_terminal(&self, _success: bool, _reason: Option<&str>) {}
}

/// Sink that logs using tracing.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_status(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn on_progress(&self, progress: Progress) {
        tracing::debug!(progress = %progress, "Progress");
    }

    fn on_terminal(&self, success: bool, reason: Option<&str>) {
        if success {
            tracing::info!(outcome = reason.unwrap_or("done"), "Update check finished");
        } else {
            tracing::error!(reason = reason.unwrap_or("unknown"), "Update failed");
        }
    }
}

/// One recorded sink call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    Status(String),
    Progress(Progress),
    Terminal {
        success: bool,
        reason: Option<String>,
    },
}

/// Sink that records every call, for tests and replay.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<UpdateEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far.
    pub fn events(&self) -> Vec<UpdateEvent> {
        self.lock().clone()
    }

    /// Progress reports only.
    pub fn progress(&self) -> Vec<Progress> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Terminal reports only.
    pub fn terminals(&self) -> Vec<(bool, Option<String>)> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::Terminal { success, reason } => Some((*success, reason.clone())),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UpdateEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: UpdateEvent) {
        self.lock().push(event);
    }
}

impl ProgressSink for RecordingSink {
    fn on_status(&self, message: &str) {
        self.push(UpdateEvent::Status(message.to_string()));
    }

    fn on_progress(&self, progress: Progress) {
        self.push(UpdateEvent::Progress(progress));
    }

    fn on_terminal(&self, success: bool, reason: Option<&str>) {
        self.push(UpdateEvent::Terminal {
            success,
            reason: reason.map(str::to_string),
        });
    }
}
