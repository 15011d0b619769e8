//! hsota-core: over-the-air firmware updates for the HomeSense monitor.
//!
//! The crate checks a remote manifest for a newer firmware version, streams
//! the image over HTTP and writes it chunk by chunk into a flash partition,
//! then commits the partition and schedules a restart. Images uploaded by
//! the user are written through the same path.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Manifest / Version**: manifest parsing and the "is newer" gate
//! - **Transport**: HTTP abstraction for the manifest and image endpoints (reqwest, mock)
//! - **Flash**: partition backends (file, memory) and the write session state machine
//! - **State**: orchestrator phases and transitions
//! - **Events**: progress sink for UI decoupling
//! - **Orchestrator**: high-level update attempt, single-flight
//! - **Scheduler**: periodic and on-demand checks on a background thread
//! - **Image**: ESP application image header parsing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hsota_core::config::UpdateConfig;
//! use hsota_core::device::HostDevice;
//! use hsota_core::flash::FileFlash;
//! use hsota_core::orchestrator::UpdateOrchestrator;
//! use hsota_core::transport::HttpTransport;
//!
//! let config = UpdateConfig::default();
//! let flash = FileFlash::open(&config.flash).expect("flash");
//! let transport = HttpTransport::new(&config).expect("http client");
//!
//! let orchestrator = UpdateOrchestrator::new(
//!     config,
//!     hsota_core::FIRMWARE_VERSION,
//!     transport,
//!     flash,
//!     Arc::new(HostDevice::new()),
//! )
//! .expect("invalid config");
//! orchestrator.check_for_update().expect("update failed");
//! ```

pub mod config;
pub mod device;
pub mod events;
pub mod flash;
pub mod image;
pub mod manifest;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod transport;
pub mod version;

/// Version of the firmware this crate is built into.
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for convenience
pub use config::{ConfigError, UpdateConfig};
pub use device::{DeviceControl, HostDevice};
pub use events::{NullSink, Progress, ProgressSink, RecordingSink, TracingSink, UpdateEvent};
pub use flash::{
    BeginError, CommitError, FileFlash, FlashBackend, FlashError, FlashWriteSession, MemoryFlash,
    SessionState, UpdateTarget, WriteError,
};
pub use image::{ImageHeader, ImageHeaderError};
pub use manifest::{FirmwareManifest, ReleasePattern};
pub use orchestrator::{InstalledImage, UpdateError, UpdateOrchestrator, UpdateOutcome};
pub use scheduler::UpdateScheduler;
pub use state::UpdatePhase;
pub use transport::{
    ByteStream, DownloadError, FetchError, HttpTransport, ManifestFetcher, MockNetwork,
    StreamingDownloader,
};
pub use version::is_newer;
