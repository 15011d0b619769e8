//! Flash layer module.

pub mod file;
pub mod memory;
pub mod session;
pub mod traits;

pub use file::{BootRecord, FileFlash};
pub use memory::MemoryFlash;
pub use session::{BeginError, CommitError, FlashWriteSession, SessionState, WriteError};
pub use traits::{FlashBackend, FlashError, UpdateTarget};
