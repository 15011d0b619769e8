//! In-memory flash backend for testing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::traits::{FlashBackend, FlashError, UpdateTarget};

#[derive(Debug, Default)]
struct Partition {
    capacity: u64,
    /// Staging region, present while reserved.
    staging: Option<Vec<u8>>,
    /// Last finalized image.
    active: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    partitions: HashMap<UpdateTarget, Partition>,
    write_calls: usize,
    /// (call number, bytes accepted) for an injected short write.
    short_write: Option<(usize, usize)>,
    fail_reserve: bool,
    fail_finalize: bool,
    reserves: usize,
    releases: usize,
    last_committed: Option<UpdateTarget>,
}

/// Flash backend that keeps both partitions in memory.
///
/// Clones share state, so a test can keep a handle for inspection after
/// handing one to the orchestrator.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFlash {
    pub fn new(app_capacity: u64, fs_capacity: u64) -> Self {
        let mut partitions = HashMap::new();
        partitions.insert(
            UpdateTarget::ApplicationImage,
            Partition {
                capacity: app_capacity,
                ..Default::default()
            },
        );
        partitions.insert(
            UpdateTarget::FilesystemImage,
            Partition {
                capacity: fs_capacity,
                ..Default::default()
            },
        );
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                partitions,
                ..Default::default()
            })),
        }
    }

    /// Make the `call`-th write (1-based) accept only `accepted` bytes.
    pub fn short_write_on_call(&self, call: usize, accepted: usize) {
        self.state.lock().unwrap().short_write = Some((call, accepted));
    }

    /// Make every reservation fail with `OutOfSpace`.
    pub fn fail_reserve(&self, fail: bool) {
        self.state.lock().unwrap().fail_reserve = fail;
    }

    /// Make every finalize fail verification.
    pub fn fail_finalize(&self, fail: bool) {
        self.state.lock().unwrap().fail_finalize = fail;
    }

    /// The finalized image on `target`, if any.
    pub fn active_image(&self, target: UpdateTarget) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .partitions
            .get(&target)
            .and_then(|p| p.active.clone())
    }

    /// Bytes staged on `target` by an uncommitted session.
    pub fn staged_len(&self, target: UpdateTarget) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .partitions
            .get(&target)
            .and_then(|p| p.staging.as_ref().map(Vec::len))
    }

    pub fn last_committed(&self) -> Option<UpdateTarget> {
        self.state.lock().unwrap().last_committed
    }

    pub fn reserves(&self) -> usize {
        self.state.lock().unwrap().reserves
    }

    pub fn releases(&self) -> usize {
        self.state.lock().unwrap().releases
    }

    pub fn write_calls(&self) -> usize {
        self.state.lock().unwrap().write_calls
    }
}

impl FlashBackend for MemoryFlash {
    fn capacity(&self, target: UpdateTarget) -> u64 {
        self.state
            .lock()
            .unwrap()
            .partitions
            .get(&target)
            .map_or(0, |p| p.capacity)
    }

    fn reserve(&mut self, target: UpdateTarget, size: u64) -> Result<(), FlashError> {
        let mut state = self.state.lock().unwrap();
        state.reserves += 1;
        let fail = state.fail_reserve;
        let partition = state.partitions.entry(target).or_default();
        if fail || size > partition.capacity {
            return Err(FlashError::OutOfSpace {
                target,
                requested: size,
                capacity: partition.capacity,
            });
        }
        partition.staging = Some(Vec::with_capacity(size as usize));
        Ok(())
    }

    fn write(&mut self, target: UpdateTarget, offset: u64, data: &[u8]) -> Result<usize, FlashError> {
        let mut state = self.state.lock().unwrap();
        state.write_calls += 1;
        let accepted = match state.short_write {
            Some((call, accepted)) if call == state.write_calls => accepted.min(data.len()),
            _ => data.len(),
        };

        let staging = state
            .partitions
            .get_mut(&target)
            .and_then(|p| p.staging.as_mut())
            .ok_or(FlashError::NotReserved(target))?;
        if offset != staging.len() as u64 {
            return Err(FlashError::Verify(format!(
                "non-sequential write at {} (staged {})",
                offset,
                staging.len()
            )));
        }
        staging.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn finalize(&mut self, target: UpdateTarget, len: u64) -> Result<(), FlashError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_finalize {
            return Err(FlashError::Verify("injected finalize failure".into()));
        }
        let partition = state
            .partitions
            .get_mut(&target)
            .ok_or(FlashError::NotReserved(target))?;
        let staging = partition.staging.take().ok_or(FlashError::NotReserved(target))?;
        if staging.len() as u64 != len {
            let staged = staging.len();
            partition.staging = Some(staging);
            return Err(FlashError::Verify(format!(
                "expected {} bytes, staged {}",
                len, staged
            )));
        }
        partition.active = Some(staging);
        state.last_committed = Some(target);
        Ok(())
    }

    fn release(&mut self, target: UpdateTarget) {
        let mut state = self.state.lock().unwrap();
        if let Some(partition) = state.partitions.get_mut(&target) {
            partition.staging = None;
        }
        state.releases += 1;
    }
}
