//! Flash write session - owns one partition region for one update.
//!
//! ```text
//! Idle --begin--> Began --write_chunk--> Writing --commit--> Committed
//!                   |                       |
//!                   +------- abort ---------+----> Aborted
//! ```
//!
//! Any failed write or commit ends the session in `Aborted`; a session is
//! never left `Writing` after an error.

use std::fmt;

use thiserror::Error;
use tracing::{info, trace, warn};

use super::traits::{FlashBackend, FlashError, UpdateTarget};
use crate::image::IMAGE_MAGIC;

/// Write session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Began,
    Writing,
    Committed,
    Aborted,
}

impl SessionState {
    /// Whether a region is currently reserved.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Began | SessionState::Writing)
    }

    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Began => write!(f, "BEGAN"),
            SessionState::Writing => write!(f, "WRITING"),
            SessionState::Committed => write!(f, "COMMITTED"),
            SessionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BeginError {
    #[error("Not enough space on {target} partition: {requested} bytes requested, {capacity} available")]
    InsufficientSpace {
        target: UpdateTarget,
        requested: u64,
        capacity: u64,
    },

    #[error("Cannot begin: session is {0}")]
    InvalidState(SessionState),

    #[error("Flash error: {0}")]
    Flash(FlashError),
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Cannot write: session is {0}")]
    InvalidState(SessionState),

    #[error("Flash accepted {written} of {expected} bytes")]
    LengthMismatch { expected: usize, written: usize },

    #[error("Image exceeds {limit} bytes (write would reach {attempted})")]
    Overflow { limit: u64, attempted: u64 },

    #[error("Not an application image (first byte 0x{found:02X})")]
    InvalidImageMagic { found: u8 },

    #[error("Flash error: {0}")]
    Flash(FlashError),
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("Cannot commit: session is {0}")]
    InvalidState(SessionState),

    #[error("Size mismatch: wrote {written} bytes, expected {}", expected_display(.expected))]
    SizeMismatch { expected: Option<u64>, written: u64 },

    #[error("Image integrity check failed: {0}")]
    Integrity(FlashError),
}

fn expected_display(expected: &Option<u64>) -> String {
    match expected {
        Some(total) => total.to_string(),
        None => "a non-empty image".to_string(),
    }
}

/// The reserved region of an active session.
#[derive(Debug, Clone, Copy)]
struct Region {
    target: UpdateTarget,
    reserved: u64,
    total: Option<u64>,
}

/// One update's exclusive hold on a flash partition.
///
/// Dropping an active session aborts it.
pub struct FlashWriteSession<'a, F: FlashBackend> {
    flash: &'a mut F,
    region: Option<Region>,
    written: u64,
    state: SessionState,
}

impl<'a, F: FlashBackend> FlashWriteSession<'a, F> {
    pub fn new(flash: &'a mut F) -> Self {
        Self {
            flash,
            region: None,
            written: 0,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> Option<UpdateTarget> {
        self.region.map(|r| r.target)
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Expected image size, once known.
    pub fn total(&self) -> Option<u64> {
        self.region.and_then(|r| r.total)
    }

    /// Reserve `size_hint` bytes (or the whole partition) on `target`.
    pub fn begin(&mut self, target: UpdateTarget, size_hint: Option<u64>) -> Result<(), BeginError> {
        if self.state != SessionState::Idle {
            return Err(BeginError::InvalidState(self.state));
        }

        let capacity = self.flash.capacity(target);
        let requested = size_hint.unwrap_or(capacity);
        if requested > capacity {
            return Err(BeginError::InsufficientSpace {
                target,
                requested,
                capacity,
            });
        }

        self.flash
            .reserve(target, requested)
            .map_err(|e| match e {
                FlashError::OutOfSpace {
                    target,
                    requested,
                    capacity,
                } => BeginError::InsufficientSpace {
                    target,
                    requested,
                    capacity,
                },
                other => BeginError::Flash(other),
            })?;

        info!(partition = %target, reserved = requested, hint = ?size_hint, "Flash region reserved");
        self.region = Some(Region {
            target,
            reserved: requested,
            total: size_hint,
        });
        self.state = SessionState::Began;
        Ok(())
    }

    /// Record the image size reported once the stream is open.
    pub fn declare_total(&mut self, total: u64) -> Result<(), BeginError> {
        let Some(region) = self.region.as_mut().filter(|_| self.state == SessionState::Began)
        else {
            return Err(BeginError::InvalidState(self.state));
        };

        if total > region.reserved {
            let err = BeginError::InsufficientSpace {
                target: region.target,
                requested: total,
                capacity: region.reserved,
            };
            self.abort();
            return Err(err);
        }

        region.total = Some(total);
        Ok(())
    }

    /// Append `data` at the current offset.
    ///
    /// Returns the number of bytes stored, which always equals `data.len()`;
    /// a shorter write from the backend aborts the session instead.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let Some(region) = self.region.filter(|_| self.state.is_active()) else {
            return Err(WriteError::InvalidState(self.state));
        };
        if data.is_empty() {
            return Ok(0);
        }

        let limit = region.total.unwrap_or(region.reserved);
        let attempted = self.written + data.len() as u64;
        if attempted > limit {
            self.abort();
            return Err(WriteError::Overflow { limit, attempted });
        }

        if region.target == UpdateTarget::ApplicationImage
            && self.written == 0
            && data[0] != IMAGE_MAGIC
        {
            self.abort();
            return Err(WriteError::InvalidImageMagic { found: data[0] });
        }

        match self.flash.write(region.target, self.written, data) {
            Ok(n) if n == data.len() => {
                self.written += n as u64;
                self.state = SessionState::Writing;
                trace!(offset = self.written, len = n, "Chunk written");
                Ok(n)
            }
            Ok(n) => {
                warn!(expected = data.len(), written = n, "Short flash write");
                self.abort();
                Err(WriteError::LengthMismatch {
                    expected: data.len(),
                    written: n,
                })
            }
            Err(e) => {
                self.abort();
                Err(WriteError::Flash(e))
            }
        }
    }

    /// Finalize the region and make it the active image.
    pub fn commit(&mut self) -> Result<(), CommitError> {
        let Some(region) = self.region.filter(|_| self.state.is_active()) else {
            return Err(CommitError::InvalidState(self.state));
        };

        let complete = match region.total {
            Some(total) => self.written == total,
            None => self.written > 0,
        };
        if !complete {
            let err = CommitError::SizeMismatch {
                expected: region.total,
                written: self.written,
            };
            self.abort();
            return Err(err);
        }

        if let Err(e) = self.flash.finalize(region.target, self.written) {
            self.abort();
            return Err(CommitError::Integrity(e));
        }

        info!(partition = %region.target, bytes = self.written, "Flash region committed");
        self.region = None;
        self.state = SessionState::Committed;
        Ok(())
    }

    /// Release the region without finalizing. Idempotent.
    pub fn abort(&mut self) {
        if !self.state.is_active() {
            return;
        }
        if let Some(region) = self.region.take() {
            self.flash.release(region.target);
            warn!(partition = %region.target, written = self.written, "Flash session aborted");
        }
        self.state = SessionState::Aborted;
    }
}

impl<F: FlashBackend> Drop for FlashWriteSession<'_, F> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemoryFlash;

    const APP: UpdateTarget = UpdateTarget::ApplicationImage;
    const FS: UpdateTarget = UpdateTarget::FilesystemImage;

    fn app_image(len: usize) -> Vec<u8> {
        let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        data[0] = IMAGE_MAGIC;
        data
    }

    #[test]
    fn test_full_write_commits() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let image = app_image(1000);
        {
            let mut session = FlashWriteSession::new(&mut flash);
            session.begin(APP, Some(1000)).unwrap();
            assert_eq!(session.state(), SessionState::Began);

            for chunk in image.chunks(128) {
                assert_eq!(session.write_chunk(chunk).unwrap(), chunk.len());
                assert_eq!(session.state(), SessionState::Writing);
            }
            assert_eq!(session.written(), 1000);
            session.commit().unwrap();
            assert_eq!(session.state(), SessionState::Committed);
        }
        assert_eq!(flash.active_image(APP).unwrap(), image);
        assert_eq!(flash.releases(), 0);
    }

    #[test]
    fn test_write_before_begin_is_rejected() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let mut session = FlashWriteSession::new(&mut flash);
        assert!(matches!(
            session.write_chunk(&[IMAGE_MAGIC]),
            Err(WriteError::InvalidState(SessionState::Idle))
        ));
        assert!(matches!(
            session.commit(),
            Err(CommitError::InvalidState(SessionState::Idle))
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_short_write_aborts_session() {
        let mut flash = MemoryFlash::new(4096, 4096);
        flash.short_write_on_call(2, 10);
        let image = app_image(300);

        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(APP, Some(300)).unwrap();
        session.write_chunk(&image[..100]).unwrap();

        let err = session.write_chunk(&image[100..200]).unwrap_err();
        assert!(matches!(
            err,
            WriteError::LengthMismatch {
                expected: 100,
                written: 10
            }
        ));
        assert_eq!(session.state(), SessionState::Aborted);

        // No further writes accepted
        assert!(matches!(
            session.write_chunk(&image[200..]),
            Err(WriteError::InvalidState(SessionState::Aborted))
        ));
        assert_eq!(session.written(), 100);
        drop(session);
        assert_eq!(flash.releases(), 1);
        assert!(flash.active_image(APP).is_none());
    }

    #[test]
    fn test_abort_is_idempotent() {
        let mut flash = MemoryFlash::new(4096, 4096);
        {
            let mut session = FlashWriteSession::new(&mut flash);
            session.abort();
            assert_eq!(session.state(), SessionState::Idle);

            session.begin(FS, None).unwrap();
            session.abort();
            session.abort();
            assert_eq!(session.state(), SessionState::Aborted);
        }
        assert_eq!(flash.releases(), 1);
    }

    #[test]
    fn test_begin_while_active_leaves_session_untouched() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let image = app_image(64);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(APP, Some(64)).unwrap();
        session.write_chunk(&image[..32]).unwrap();

        assert!(matches!(
            session.begin(FS, Some(10)),
            Err(BeginError::InvalidState(SessionState::Writing))
        ));
        assert_eq!(session.state(), SessionState::Writing);
        assert_eq!(session.target(), Some(APP));
        assert_eq!(session.written(), 32);

        session.write_chunk(&image[32..]).unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn test_begin_rejects_oversized_hint() {
        let mut flash = MemoryFlash::new(1024, 1024);
        let mut session = FlashWriteSession::new(&mut flash);
        let err = session.begin(APP, Some(2048)).unwrap_err();
        assert!(matches!(
            err,
            BeginError::InsufficientSpace {
                requested: 2048,
                capacity: 1024,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_begin_reservation_failure() {
        let mut flash = MemoryFlash::new(4096, 4096);
        flash.fail_reserve(true);
        let mut session = FlashWriteSession::new(&mut flash);
        assert!(matches!(
            session.begin(APP, None),
            Err(BeginError::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn test_commit_short_image_is_size_mismatch() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let image = app_image(100);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(APP, Some(200)).unwrap();
        session.write_chunk(&image).unwrap();

        let err = session.commit().unwrap_err();
        assert!(matches!(
            err,
            CommitError::SizeMismatch {
                expected: Some(200),
                written: 100
            }
        ));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_commit_unknown_total_uses_written_length() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let image = app_image(777);
        {
            let mut session = FlashWriteSession::new(&mut flash);
            session.begin(APP, None).unwrap();
            for chunk in image.chunks(100) {
                session.write_chunk(chunk).unwrap();
            }
            session.commit().unwrap();
        }
        assert_eq!(flash.active_image(APP).unwrap().len(), 777);
    }

    #[test]
    fn test_commit_empty_unknown_total_fails() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(FS, None).unwrap();
        assert!(matches!(
            session.commit(),
            Err(CommitError::SizeMismatch {
                expected: None,
                written: 0
            })
        ));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_finalize_failure_is_integrity_error() {
        let mut flash = MemoryFlash::new(4096, 4096);
        flash.fail_finalize(true);
        let image = app_image(50);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(APP, Some(50)).unwrap();
        session.write_chunk(&image).unwrap();

        assert!(matches!(session.commit(), Err(CommitError::Integrity(_))));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_overflow_past_declared_total() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let image = app_image(120);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(APP, None).unwrap();
        session.declare_total(100).unwrap();
        assert_eq!(session.total(), Some(100));

        session.write_chunk(&image[..64]).unwrap();
        assert!(matches!(
            session.write_chunk(&image[64..]),
            Err(WriteError::Overflow {
                limit: 100,
                attempted: 120
            })
        ));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_declare_total_larger_than_reservation() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(APP, Some(100)).unwrap();
        assert!(matches!(
            session.declare_total(200),
            Err(BeginError::InsufficientSpace { .. })
        ));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_application_image_magic_checked() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(APP, None).unwrap();
        assert!(matches!(
            session.write_chunk(b"<html>"),
            Err(WriteError::InvalidImageMagic { found: b'<' })
        ));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_filesystem_image_has_no_magic() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(FS, Some(6)).unwrap();
        session.write_chunk(b"lfs-fs").unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut flash = MemoryFlash::new(4096, 4096);
        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(FS, Some(4)).unwrap();
        assert_eq!(session.write_chunk(&[]).unwrap(), 0);
        assert_eq!(session.state(), SessionState::Began);
    }

    #[test]
    fn test_drop_active_session_releases_region() {
        let mut flash = MemoryFlash::new(4096, 4096);
        {
            let mut session = FlashWriteSession::new(&mut flash);
            session.begin(FS, Some(10)).unwrap();
            session.write_chunk(&[1, 2, 3]).unwrap();
        }
        assert_eq!(flash.releases(), 1);
        assert!(flash.active_image(FS).is_none());
    }
}
