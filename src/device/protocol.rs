//! Device protocol abstraction.
//!
//! A [`ProtocolClient`] is the single owner of one open device connection.
//! It is only ever driven by that device's worker task, so implementations
//! take `&mut self` and never need internal locking.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

/// Opaque protocol-level object handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u32);

impl ObjectHandle {
    /// Pseudo-handle for the root of a storage.
    pub const ROOT: ObjectHandle = ObjectHandle(0xFFFF_FFFF);
}

/// Identifier of one storage area on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageId(pub u32);

/// What kind of object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    File,
    Folder,
}

/// Metadata for one object on a device storage.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub handle: ObjectHandle,
    pub name: String,
    pub kind: ObjectKind,
    /// Size in bytes; 0 for folders.
    pub size: u64,
    /// Modification time as Unix seconds, when the device reports one.
    pub modified_at: Option<i64>,
}

impl ObjectInfo {
    pub fn is_folder(&self) -> bool {
        self.kind == ObjectKind::Folder
    }
}

/// Metadata for one storage area of a device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    /// Protocol storage id.
    pub id: u32,
    /// Storage description (e.g. "Internal shared storage").
    pub name: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    /// True when the storage reports no write capability.
    pub read_only: bool,
}

/// Identity of a removable device, as reported by discovery plus whatever
/// the protocol adds once a session is open.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    /// Stable device id (e.g. "device-336592896").
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceIdentity {
    /// Human-readable name: product, falling back to manufacturer, falling
    /// back to the vendor:product pair.
    pub fn display_name(&self) -> String {
        if let Some(product) = &self.product {
            if !product.is_empty() {
                return product.clone();
            }
        }
        if let Some(manufacturer) = &self.manufacturer {
            if !manufacturer.is_empty() {
                return manufacturer.clone();
            }
        }
        format!("Device {:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Low-level failure reported by a protocol client.
///
/// These are transport-shaped; [`map_protocol_failure`](super::errors::map_protocol_failure)
/// turns them into the public [`DeviceError`](super::DeviceError) taxonomy.
#[derive(Debug, Clone)]
pub enum ProtocolFailure {
    /// The device is gone (unplugged, powered off, session torn down).
    Disconnected,
    /// The operation did not complete within the protocol timeout.
    Timeout,
    /// Another process holds exclusive access to the device.
    ExclusiveAccess { owner_hint: Option<String> },
    /// The device reported it is busy; retrying later may succeed.
    Busy,
    /// The referenced object or storage does not exist.
    NotFound,
    /// The storage rejects writes.
    ReadOnly,
    /// The device denied the operation.
    AccessDenied,
    /// Not enough free space on the storage.
    StorageFull,
    /// The operation is not supported by this device.
    Unsupported,
    /// The caller-side chunk stream ended early or was dropped.
    TransferAborted,
    /// The device sent something the client could not interpret.
    InvalidData(String),
    /// Any other protocol-level error.
    Protocol(String),
}

impl std::fmt::Display for ProtocolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolFailure::Disconnected => write!(f, "device disconnected"),
            ProtocolFailure::Timeout => write!(f, "operation timed out"),
            ProtocolFailure::ExclusiveAccess { owner_hint: Some(owner) } => {
                write!(f, "device claimed by another process ({})", owner)
            }
            ProtocolFailure::ExclusiveAccess { owner_hint: None } => {
                write!(f, "device claimed by another process")
            }
            ProtocolFailure::Busy => write!(f, "device busy"),
            ProtocolFailure::NotFound => write!(f, "object not found"),
            ProtocolFailure::ReadOnly => write!(f, "storage is read-only"),
            ProtocolFailure::AccessDenied => write!(f, "access denied by device"),
            ProtocolFailure::StorageFull => write!(f, "storage full"),
            ProtocolFailure::Unsupported => write!(f, "operation not supported by device"),
            ProtocolFailure::TransferAborted => write!(f, "transfer aborted"),
            ProtocolFailure::InvalidData(msg) => write!(f, "invalid data from device: {}", msg),
            ProtocolFailure::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolFailure {}

/// Sink for download chunks. Bounded; the producer blocks when the consumer
/// falls behind, which is what bounds transfer memory.
pub type ChunkSender = mpsc::Sender<Result<Bytes, ProtocolFailure>>;

/// Receiving side of a download chunk channel.
pub type ChunkReceiver = mpsc::Receiver<Result<Bytes, ProtocolFailure>>;

/// One open device connection.
#[async_trait]
pub trait ProtocolClient: Send {
    /// Enumerate the device's storages.
    async fn storages(&mut self) -> Result<Vec<StorageInfo>, ProtocolFailure>;

    /// List the direct children of `parent`.
    async fn list_children(
        &mut self,
        storage: StorageId,
        parent: ObjectHandle,
    ) -> Result<Vec<ObjectInfo>, ProtocolFailure>;

    /// Fetch metadata for one object.
    async fn object_info(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
    ) -> Result<ObjectInfo, ProtocolFailure>;

    /// Create an empty folder under `parent` and return its handle.
    async fn create_folder(
        &mut self,
        storage: StorageId,
        parent: ObjectHandle,
        name: &str,
    ) -> Result<ObjectHandle, ProtocolFailure>;

    /// Delete one object. Folders must already be empty.
    async fn delete(&mut self, storage: StorageId, handle: ObjectHandle)
        -> Result<(), ProtocolFailure>;

    /// Rename an object in place.
    async fn rename(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
        new_name: &str,
    ) -> Result<(), ProtocolFailure>;

    /// Move an object to a new parent folder on the same storage.
    async fn move_object(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
        new_parent: ObjectHandle,
    ) -> Result<(), ProtocolFailure>;

    /// Download an object, pushing ordered chunks into `sink` until EOF.
    /// Returns the number of bytes pushed. Must stop promptly when `sink`
    /// is closed by the receiver.
    async fn download(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
        sink: ChunkSender,
    ) -> Result<u64, ProtocolFailure>;

    /// Create a file of exactly `total_size` bytes under `parent`, consuming
    /// ordered chunks from `source`. Fails with [`ProtocolFailure::TransferAborted`]
    /// if `source` closes before `total_size` bytes arrived.
    async fn upload(
        &mut self,
        storage: StorageId,
        parent: ObjectHandle,
        name: &str,
        total_size: u64,
        source: mpsc::Receiver<Bytes>,
    ) -> Result<ObjectHandle, ProtocolFailure>;

    /// Tear the connection down. Best effort.
    async fn close(&mut self);
}

/// Result of opening a device: the refreshed identity plus a live client.
pub struct OpenedDevice {
    pub identity: DeviceIdentity,
    pub client: Box<dyn ProtocolClient>,
}

/// Opens protocol connections by device id. Implemented by the real
/// transport adapter and by test fakes.
#[async_trait]
pub trait DeviceOpener: Send + Sync {
    async fn open(&self, device_id: &str) -> Result<OpenedDevice, ProtocolFailure>;
}
