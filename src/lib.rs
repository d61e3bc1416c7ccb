//! Unified storage volumes and a strategy-selecting transfer engine.
//!
//! Three backend classes live behind one [`Volume`](volume::Volume)
//! contract: local disks, network-protocol mounts, and removable devices
//! reached through an object-enumeration transfer protocol. The
//! [`DeviceSessionManager`](device::DeviceSessionManager) serializes all
//! protocol traffic through one worker per device and keeps path and
//! listing caches that never survive a mutation. The
//! [`TransferEngine`](transfer::TransferEngine) copies or moves files
//! between any two volumes, picking the cheapest strategy the endpoints
//! support: plain copy, chunked copy, direct streaming, or staging
//! through a local temporary file.

pub mod config;
pub mod device;
pub mod transfer;
pub mod volume;

pub use config::{SessionConfig, TransferConfig};
pub use device::{ConnectionState, DeviceError, DeviceSessionManager, SessionInfo};
pub use transfer::{
    TransferEngine, TransferError, TransferHandle, TransferOptions, TransferProgress,
    TransferRequest, TransferStrategy, TransferSummary,
};
pub use volume::{
    DeviceVolume, FileEntry, InMemoryVolume, LocalVolume, Volume, VolumeError, VolumeRegistry,
};
