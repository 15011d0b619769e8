//! Terminal progress rendering.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use hsota_core::{Progress, ProgressSink};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

/// Progress sink drawing an indicatif bar on stderr.
///
/// The bar starts as a spinner and switches to a percentage bar once the
/// image size is known.
pub struct IndicatifSink {
    bar: Mutex<ProgressBar>,
    spinner_style: ProgressStyle,
    percent_style: ProgressStyle,
}

impl IndicatifSink {
    pub fn new() -> Result<Self> {
        let spinner_style = ProgressStyle::with_template("   {spinner:.green} {msg}")?;
        let percent_style = ProgressStyle::with_template(
            "   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}",
        )?
        .progress_chars("=> ");

        let sink = Self {
            bar: Mutex::new(ProgressBar::hidden()),
            spinner_style,
            percent_style,
        };
        *sink.bar() = sink.fresh_bar();
        Ok(sink)
    }

    fn fresh_bar(&self) -> ProgressBar {
        let bar = ProgressBar::new_spinner().with_style(self.spinner_style.clone());
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    }

    fn bar(&self) -> MutexGuard<'_, ProgressBar> {
        self.bar.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProgressSink for IndicatifSink {
    fn on_status(&self, message: &str) {
        let mut bar = self.bar();
        if bar.is_finished() {
            *bar = self.fresh_bar();
        }
        bar.set_message(message.to_string());
    }

    fn on_progress(&self, progress: Progress) {
        let bar = self.bar();
        match progress {
            Progress::Percent(pct) => {
                if bar.length() != Some(100) {
                    bar.set_length(100);
                    bar.set_style(self.percent_style.clone());
                }
                bar.set_position(u64::from(pct));
            }
            Progress::Indeterminate { written } => {
                bar.set_message(format!("{} written", HumanBytes(written)));
            }
        }
    }

    fn on_terminal(&self, success: bool, reason: Option<&str>) {
        let bar = self.bar();
        bar.finish_and_clear();
        let reason = reason.unwrap_or_default();
        if success {
            eprintln!("   ok: {}", reason);
        } else {
            eprintln!("   failed: {}", reason);
        }
    }
}
