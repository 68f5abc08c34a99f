//! Firmware transfer for Veetr units.
//!
//! Provides:
//! - `TransferEngine` - chunked, ack-driven upload with verify and apply
//! - `TransferJob` - per-attempt bookkeeping and stage tracking
//! - `query_version` / `compare_versions` - firmware version helpers
//! - `ReleaseSource` - where images come from
//! - `FirmwareUpdater` - ties the engine to a `Session`

pub mod engine;
pub mod error;
pub mod job;
pub mod release;
pub mod updater;
pub mod version;
pub mod wait;

pub use engine::{TransferEngine, TransferProgress};
pub use error::{TransferError, TransferErrorKind};
pub use job::{Stage, TransferJob};
pub use release::{FirmwareAsset, LocalRelease, ReleaseError, ReleaseSource, StaticRelease};
pub use updater::{FirmwareUpdater, UpdateCheck, UpdateError};
pub use version::{VersionError, compare_versions, query_version};
