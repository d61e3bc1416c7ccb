//! The uniform volume contract.
//!
//! A [`Volume`] is one browsable, addressable storage tree: a local disk,
//! a network mount, or one storage of a removable device. Callers speak
//! volume-relative paths; capability probes (`local_path`,
//! `supports_streaming`, `streaming_domain`) tell the transfer engine which
//! strategies apply without downcasting.

pub mod device;
pub mod in_memory;
pub mod local;
pub mod registry;

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;

pub use device::DeviceVolume;
pub use in_memory::InMemoryVolume;
pub use local::LocalVolume;
pub use registry::VolumeRegistry;

/// One directory entry as a volume reports it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Volume-relative path of the entry.
    pub path: String,
    pub is_directory: bool,
    /// Size in bytes; `None` for directories.
    pub size: Option<u64>,
    /// Modification time as Unix seconds, when known.
    pub modified: Option<i64>,
}

/// Free/used space of a volume.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}

/// Result of a pre-copy scan: what a recursive copy of a path would move.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyScanResult {
    pub file_count: usize,
    pub dir_count: usize,
    pub total_bytes: u64,
}

/// Errors reported by volume operations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum VolumeError {
    NotFound { path: String },
    PermissionDenied { path: String },
    AlreadyExists { path: String },
    /// The volume does not implement this operation.
    NotSupported,
    /// The backing device is gone; reopen its session to recover.
    Disconnected { detail: String },
    /// Another process holds the backing device.
    ExclusiveAccess { owner_hint: Option<String> },
    Timeout { detail: String },
    /// The operation was cancelled at a chunk boundary.
    Cancelled,
    /// Not enough free space on the volume.
    StorageFull,
    /// Backend protocol failure.
    Protocol { detail: String },
    Io { message: String },
}

impl VolumeError {
    pub(crate) fn io(message: impl Into<String>) -> Self {
        VolumeError::Io {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for VolumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeError::NotFound { path } => write!(f, "not found: {}", path),
            VolumeError::PermissionDenied { path } => write!(f, "permission denied: {}", path),
            VolumeError::AlreadyExists { path } => write!(f, "already exists: {}", path),
            VolumeError::NotSupported => write!(f, "operation not supported by this volume"),
            VolumeError::Disconnected { detail } => write!(f, "device disconnected: {}", detail),
            VolumeError::ExclusiveAccess {
                owner_hint: Some(owner),
            } => write!(f, "device held by {}", owner),
            VolumeError::ExclusiveAccess { owner_hint: None } => {
                write!(f, "device held by another process")
            }
            VolumeError::Timeout { detail } => write!(f, "timed out: {}", detail),
            VolumeError::Cancelled => write!(f, "operation cancelled"),
            VolumeError::StorageFull => write!(f, "not enough free space"),
            VolumeError::Protocol { detail } => write!(f, "protocol error: {}", detail),
            VolumeError::Io { message } => write!(f, "I/O error: {}", message),
        }
    }
}

impl std::error::Error for VolumeError {}

impl From<std::io::Error> for VolumeError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => VolumeError::NotFound {
                path: e.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => VolumeError::PermissionDenied {
                path: e.to_string(),
            },
            std::io::ErrorKind::AlreadyExists => VolumeError::AlreadyExists {
                path: e.to_string(),
            },
            _ => VolumeError::Io {
                message: e.to_string(),
            },
        }
    }
}

/// Ordered chunk stream read out of a volume.
pub trait VolumeReadStream: Send {
    /// Next chunk, in order; `None` at end of file.
    fn next_chunk(&mut self) -> Option<Result<Bytes, VolumeError>>;

    /// Total size of the object, known before the first chunk.
    fn total_size(&self) -> u64;

    /// Bytes handed out so far.
    fn bytes_read(&self) -> u64;
}

/// Uniform contract over heterogeneous storage backends.
///
/// Browsing and metadata are required. Mutations and transfer hooks default
/// to [`VolumeError::NotSupported`] so read-only backends implement only
/// what they have.
pub trait Volume: Send + Sync {
    /// Display name of the volume.
    fn name(&self) -> &str;

    /// Root path (for local volumes, the mount point; virtual otherwise).
    fn root(&self) -> &Path;

    fn list(&self, path: &Path) -> Result<Vec<FileEntry>, VolumeError>;

    fn stat(&self, path: &Path) -> Result<FileEntry, VolumeError>;

    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }

    fn is_directory(&self, path: &Path) -> Result<bool, VolumeError> {
        Ok(self.stat(path)?.is_directory)
    }

    fn create_folder(&self, _path: &Path) -> Result<(), VolumeError> {
        Err(VolumeError::NotSupported)
    }

    fn delete(&self, _path: &Path) -> Result<(), VolumeError> {
        Err(VolumeError::NotSupported)
    }

    fn rename(&self, _path: &Path, _new_name: &str) -> Result<(), VolumeError> {
        Err(VolumeError::NotSupported)
    }

    /// Moves an entry under a different parent directory on this volume.
    fn move_entry(&self, _path: &Path, _new_parent: &Path) -> Result<(), VolumeError> {
        Err(VolumeError::NotSupported)
    }

    /// Counts files, directories and bytes a recursive copy of `path`
    /// would move. Used for transfer pre-flight.
    fn scan_for_copy(&self, _path: &Path) -> Result<CopyScanResult, VolumeError> {
        Err(VolumeError::NotSupported)
    }

    fn space_info(&self) -> Result<SpaceInfo, VolumeError> {
        Err(VolumeError::NotSupported)
    }

    /// Absolute filesystem path of `root()` when this volume is plain
    /// local storage. `None` for device-backed volumes.
    fn local_path(&self) -> Option<PathBuf> {
        None
    }

    /// Whether the volume sits on a network-protocol mount.
    fn is_network_mount(&self) -> bool {
        false
    }

    /// Copies `source` (file or directory, recursively) out of the volume
    /// to an absolute local path. Returns bytes copied.
    fn export_to_local(&self, _source: &Path, _local_dest: &Path) -> Result<u64, VolumeError> {
        Err(VolumeError::NotSupported)
    }

    /// Copies an absolute local path (file or directory, recursively) into
    /// the volume at `dest`. Returns bytes copied.
    fn import_from_local(&self, _local_source: &Path, _dest: &Path) -> Result<u64, VolumeError> {
        Err(VolumeError::NotSupported)
    }

    /// Whether this volume can stream single files chunk by chunk.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Serialization domain for streaming. Two volumes sharing a domain
    /// are served by one strictly-ordered command queue, so streaming
    /// directly between them would deadlock; the transfer engine stages
    /// those pairs through a temporary file instead.
    fn streaming_domain(&self) -> Option<String> {
        None
    }

    /// Opens an ordered chunk stream of one file.
    fn export_streaming(&self, _source: &Path) -> Result<Box<dyn VolumeReadStream>, VolumeError> {
        Err(VolumeError::NotSupported)
    }

    /// Writes a file of exactly `total_size` bytes at `dest` from an
    /// ordered chunk stream. Returns bytes written.
    fn import_streaming(
        &self,
        _dest: &Path,
        _total_size: u64,
        _stream: Box<dyn VolumeReadStream>,
    ) -> Result<u64, VolumeError> {
        Err(VolumeError::NotSupported)
    }
}
