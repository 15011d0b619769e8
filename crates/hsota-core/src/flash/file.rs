//! File-backed flash partitions for host runs.
//!
//! Each partition is a file under the flash root. Writes go to a `.part`
//! staging file which replaces the active image on finalize, and an
//! `otadata.json` boot record names the last committed image.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::traits::{FlashBackend, FlashError, UpdateTarget};
use crate::config::FlashConfig;
use crate::image::IMAGE_MAGIC;

const BOOT_RECORD_FILE: &str = "otadata.json";
const BOOT_RECORD_STAGING: &str = "otadata.json.tmp";

/// Persisted record of the last committed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRecord {
    /// Incremented on every commit.
    pub sequence: u64,
    pub target: UpdateTarget,
    pub bytes: u64,
}

/// Flash backend that stores partitions as files.
pub struct FileFlash {
    root: PathBuf,
    app_capacity: u64,
    fs_capacity: u64,
    staging: HashMap<UpdateTarget, File>,
}

impl FileFlash {
    /// Open (creating if needed) the flash root directory.
    #[instrument(skip(config), fields(root = %config.root.display()))]
    pub fn open(config: &FlashConfig) -> Result<Self, FlashError> {
        fs::create_dir_all(&config.root)?;
        debug!("Flash root ready");
        Ok(Self {
            root: config.root.clone(),
            app_capacity: config.app_capacity,
            fs_capacity: config.fs_capacity,
            staging: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the active image for `target`.
    pub fn image_path(&self, target: UpdateTarget) -> PathBuf {
        self.root.join(format!("{}.bin", target.label()))
    }

    fn staging_path(&self, target: UpdateTarget) -> PathBuf {
        self.root.join(format!("{}.bin.part", target.label()))
    }

    /// Read the boot record, if any image has been committed.
    pub fn boot_record(&self) -> Result<Option<BootRecord>, FlashError> {
        let path = self.root.join(BOOT_RECORD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| FlashError::Verify(format!("corrupt boot record: {}", e)))
    }

    /// Write the record for the next commit next to the live one.
    ///
    /// An unreadable record restarts the sequence instead of blocking commits.
    fn stage_boot_record(&self, target: UpdateTarget, bytes: u64) -> Result<PathBuf, FlashError> {
        let previous = match self.boot_record() {
            Ok(record) => record.map_or(0, |r| r.sequence),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable boot record");
                0
            }
        };
        let record = BootRecord {
            sequence: previous + 1,
            target,
            bytes,
        };
        let content = serde_json::to_string_pretty(&record)
            .map_err(|e| FlashError::Verify(e.to_string()))?;
        let path = self.root.join(BOOT_RECORD_STAGING);
        fs::write(&path, content)?;
        Ok(path)
    }

    fn discard_staging(&self, target: UpdateTarget) {
        let _ = fs::remove_file(self.staging_path(target));
    }
}

impl FlashBackend for FileFlash {
    fn capacity(&self, target: UpdateTarget) -> u64 {
        match target {
            UpdateTarget::ApplicationImage => self.app_capacity,
            UpdateTarget::FilesystemImage => self.fs_capacity,
        }
    }

    #[instrument(skip(self, target), fields(partition = %target))]
    fn reserve(&mut self, target: UpdateTarget, size: u64) -> Result<(), FlashError> {
        let capacity = self.capacity(target);
        if size > capacity {
            return Err(FlashError::OutOfSpace {
                target,
                requested: size,
                capacity,
            });
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(self.staging_path(target))?;
        self.staging.insert(target, file);
        Ok(())
    }

    fn write(&mut self, target: UpdateTarget, offset: u64, data: &[u8]) -> Result<usize, FlashError> {
        let file = self
            .staging
            .get_mut(&target)
            .ok_or(FlashError::NotReserved(target))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    #[instrument(skip(self, target), fields(partition = %target))]
    fn finalize(&mut self, target: UpdateTarget, len: u64) -> Result<(), FlashError> {
        let file = self
            .staging
            .remove(&target)
            .ok_or(FlashError::NotReserved(target))?;

        if let Err(e) = verify_staged(file, target, len) {
            self.discard_staging(target);
            return Err(e);
        }

        let record = match self.stage_boot_record(target, len) {
            Ok(path) => path,
            Err(e) => {
                self.discard_staging(target);
                return Err(e);
            }
        };

        // The image rename is the commit point.
        if let Err(e) = fs::rename(self.staging_path(target), self.image_path(target)) {
            self.discard_staging(target);
            let _ = fs::remove_file(&record);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&record, self.root.join(BOOT_RECORD_FILE)) {
            warn!(error = %e, "Image activated but boot record not updated");
        }
        info!(partition = %target, bytes = len, "Image activated");
        Ok(())
    }

    fn release(&mut self, target: UpdateTarget) {
        if self.staging.remove(&target).is_some() {
            self.discard_staging(target);
            debug!(partition = %target, "Staging file discarded");
        }
    }
}

/// Flush the staging file and check its length and, for app images, magic.
fn verify_staged(mut file: File, target: UpdateTarget, len: u64) -> Result<(), FlashError> {
    file.flush()?;
    file.sync_all()?;

    let staged = file.metadata()?.len();
    if staged != len {
        return Err(FlashError::Verify(format!(
            "expected {} bytes, staged {}",
            len, staged
        )));
    }

    if target == UpdateTarget::ApplicationImage {
        let mut magic = [0u8; 1];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut magic)?;
        if magic[0] != IMAGE_MAGIC {
            return Err(FlashError::Verify(format!(
                "bad image magic 0x{:02X}",
                magic[0]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashWriteSession, SessionState};
    use tempfile::TempDir;

    fn flash_in(dir: &TempDir) -> FileFlash {
        FileFlash::open(&FlashConfig {
            root: dir.path().join("flash"),
            app_capacity: 64,
            fs_capacity: 32,
        })
        .unwrap()
    }

    #[test]
    fn test_file_flash_commit_writes_image_and_record() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        let target = UpdateTarget::ApplicationImage;

        flash.reserve(target, 4).unwrap();
        flash.write(target, 0, &[IMAGE_MAGIC, 1]).unwrap();
        flash.write(target, 2, &[2, 3]).unwrap();
        flash.finalize(target, 4).unwrap();

        assert_eq!(
            fs::read(flash.image_path(target)).unwrap(),
            vec![IMAGE_MAGIC, 1, 2, 3]
        );
        let record = flash.boot_record().unwrap().unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.target, target);
        assert_eq!(record.bytes, 4);
        assert!(!flash.staging_path(target).exists());
    }

    #[test]
    fn test_file_flash_sequence_increments() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        let target = UpdateTarget::FilesystemImage;
        for _ in 0..2 {
            flash.reserve(target, 3).unwrap();
            flash.write(target, 0, b"lfs").unwrap();
            flash.finalize(target, 3).unwrap();
        }
        assert_eq!(flash.boot_record().unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn test_file_flash_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        let target = UpdateTarget::ApplicationImage;
        flash.reserve(target, 2).unwrap();
        flash.write(target, 0, b"PK").unwrap();
        assert!(matches!(flash.finalize(target, 2), Err(FlashError::Verify(_))));
        assert!(!flash.image_path(target).exists());
        assert!(!flash.staging_path(target).exists());
        assert!(flash.boot_record().unwrap().is_none());
    }

    #[test]
    fn test_file_flash_length_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        let target = UpdateTarget::FilesystemImage;
        flash.reserve(target, 8).unwrap();
        flash.write(target, 0, b"abc").unwrap();
        assert!(flash.finalize(target, 8).is_err());
    }

    #[test]
    fn test_file_flash_release_removes_staging() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        let target = UpdateTarget::ApplicationImage;
        flash.reserve(target, 8).unwrap();
        flash.write(target, 0, &[IMAGE_MAGIC]).unwrap();
        assert!(flash.staging_path(target).exists());

        flash.release(target);
        assert!(!flash.staging_path(target).exists());
        assert!(matches!(
            flash.write(target, 1, &[0]),
            Err(FlashError::NotReserved(_))
        ));
    }

    #[test]
    fn test_file_flash_corrupt_record_restarts_sequence() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        fs::write(flash.root().join(BOOT_RECORD_FILE), "garbage").unwrap();
        assert!(flash.boot_record().is_err());

        let target = UpdateTarget::ApplicationImage;
        flash.reserve(target, 2).unwrap();
        flash.write(target, 0, &[IMAGE_MAGIC, 7]).unwrap();
        flash.finalize(target, 2).unwrap();

        let record = flash.boot_record().unwrap().unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.bytes, 2);
        assert!(!flash.root().join(BOOT_RECORD_STAGING).exists());
    }

    #[test]
    fn test_session_commit_over_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        fs::write(flash.root().join(BOOT_RECORD_FILE), "garbage").unwrap();
        let target = UpdateTarget::ApplicationImage;

        let mut session = FlashWriteSession::new(&mut flash);
        session.begin(target, Some(3)).unwrap();
        session.write_chunk(&[IMAGE_MAGIC, 1, 2]).unwrap();
        session.commit().unwrap();
        assert_eq!(session.state(), SessionState::Committed);
        drop(session);

        assert_eq!(fs::read(flash.image_path(target)).unwrap(), vec![IMAGE_MAGIC, 1, 2]);
        assert_eq!(flash.boot_record().unwrap().unwrap().sequence, 1);
    }

    #[test]
    fn test_file_flash_record_failure_keeps_previous_image() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        let target = UpdateTarget::ApplicationImage;

        flash.reserve(target, 2).unwrap();
        flash.write(target, 0, &[IMAGE_MAGIC, 1]).unwrap();
        flash.finalize(target, 2).unwrap();

        // A directory in the way makes the record write fail
        fs::create_dir(flash.root().join(BOOT_RECORD_STAGING)).unwrap();
        flash.reserve(target, 2).unwrap();
        flash.write(target, 0, &[IMAGE_MAGIC, 2]).unwrap();
        assert!(matches!(flash.finalize(target, 2), Err(FlashError::Io(_))));

        assert_eq!(fs::read(flash.image_path(target)).unwrap(), vec![IMAGE_MAGIC, 1]);
        assert!(!flash.staging_path(target).exists());
        assert_eq!(flash.boot_record().unwrap().unwrap().sequence, 1);
    }

    #[test]
    fn test_file_flash_capacity_limit() {
        let dir = TempDir::new().unwrap();
        let mut flash = flash_in(&dir);
        assert!(matches!(
            flash.reserve(UpdateTarget::FilesystemImage, 33),
            Err(FlashError::OutOfSpace { capacity: 32, .. })
        ));
    }
}
