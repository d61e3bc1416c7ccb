//! MTP transport adapter.
//!
//! Implements [`ProtocolClient`] and [`DeviceOpener`] over the `mtp-rs`
//! crate. The client is owned by a device worker, so no locking happens
//! here; `mtp-rs` timeouts are configured once at open and protocol stalls
//! surface as [`ProtocolFailure::Timeout`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, warn};
use mtp_rs::ptp::{AccessCapability, ObjectFormatCode, ResponseCode};
use mtp_rs::{MtpDevice, MtpDeviceBuilder, NewObjectInfo};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::protocol::{
    ChunkSender, DeviceIdentity, DeviceOpener, ObjectHandle, ObjectInfo, ObjectKind, OpenedDevice,
    ProtocolClient, ProtocolFailure, StorageId, StorageInfo,
};

const DEVICE_ID_PREFIX: &str = "device-";

/// Opens MTP devices by USB location id encoded in the device id
/// ("device-{location_id}").
pub struct MtpOpener {
    timeout: Duration,
}

impl MtpOpener {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DeviceOpener for MtpOpener {
    async fn open(&self, device_id: &str) -> Result<OpenedDevice, ProtocolFailure> {
        let location_id = parse_location_id(device_id).ok_or_else(|| {
            ProtocolFailure::InvalidData(format!("malformed device id {:?}", device_id))
        })?;

        debug!("Opening MTP device at location {}", location_id);
        let device = MtpDeviceBuilder::new()
            .timeout(self.timeout)
            .open_by_location(location_id)
            .await
            .map_err(map_transport_error)?;

        let info = device.device_info();
        let identity = DeviceIdentity {
            id: device_id.to_string(),
            // Not exposed through the protocol's device info.
            vendor_id: 0,
            product_id: 0,
            manufacturer: non_empty(&info.manufacturer),
            product: non_empty(&info.model),
            serial_number: non_empty(&info.serial_number),
        };
        debug!(
            "Opened {} {}",
            identity.manufacturer.as_deref().unwrap_or("?"),
            identity.product.as_deref().unwrap_or("?")
        );

        Ok(OpenedDevice {
            identity,
            client: Box::new(MtpClient { device }),
        })
    }
}

struct MtpClient {
    device: MtpDevice,
}

impl MtpClient {
    async fn storage(&self, storage: StorageId) -> Result<mtp_rs::Storage, ProtocolFailure> {
        self.device
            .storage(mtp_rs::StorageId(storage.0))
            .await
            .map_err(map_transport_error)
    }
}

#[async_trait]
impl ProtocolClient for MtpClient {
    async fn storages(&mut self) -> Result<Vec<StorageInfo>, ProtocolFailure> {
        let storages = self.device.storages().await.map_err(map_transport_error)?;
        Ok(storages
            .iter()
            .map(|storage| {
                let info = storage.info();
                StorageInfo {
                    id: storage.id().0,
                    name: info.description.clone(),
                    total_bytes: info.max_capacity,
                    available_bytes: info.free_space_bytes,
                    read_only: !matches!(info.access_capability, AccessCapability::ReadWrite),
                }
            })
            .collect())
    }

    async fn list_children(
        &mut self,
        storage: StorageId,
        parent: ObjectHandle,
    ) -> Result<Vec<ObjectInfo>, ProtocolFailure> {
        let storage = self.storage(storage).await?;
        let objects = storage
            .list_objects(to_parent_option(parent))
            .await
            .map_err(map_transport_error)?;
        Ok(objects.into_iter().map(convert_object_info).collect())
    }

    async fn object_info(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
    ) -> Result<ObjectInfo, ProtocolFailure> {
        let storage = self.storage(storage).await?;
        let info = storage
            .get_object_info(to_mtp_handle(handle))
            .await
            .map_err(map_transport_error)?;
        Ok(convert_object_info(info))
    }

    async fn create_folder(
        &mut self,
        storage: StorageId,
        parent: ObjectHandle,
        name: &str,
    ) -> Result<ObjectHandle, ProtocolFailure> {
        let storage = self.storage(storage).await?;
        let handle = storage
            .create_folder(to_parent_option(parent), name)
            .await
            .map_err(map_transport_error)?;
        Ok(ObjectHandle(handle.0))
    }

    async fn delete(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
    ) -> Result<(), ProtocolFailure> {
        let storage = self.storage(storage).await?;
        storage
            .delete(to_mtp_handle(handle))
            .await
            .map_err(map_transport_error)
    }

    async fn rename(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
        new_name: &str,
    ) -> Result<(), ProtocolFailure> {
        let storage = self.storage(storage).await?;
        storage
            .rename(to_mtp_handle(handle), new_name)
            .await
            .map_err(map_transport_error)
    }

    async fn move_object(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
        new_parent: ObjectHandle,
    ) -> Result<(), ProtocolFailure> {
        let storage = self.storage(storage).await?;
        storage
            .move_object(to_mtp_handle(handle), to_mtp_handle(new_parent), None)
            .await
            .map_err(map_transport_error)
    }

    async fn download(
        &mut self,
        storage: StorageId,
        handle: ObjectHandle,
        sink: ChunkSender,
    ) -> Result<u64, ProtocolFailure> {
        let storage = self.storage(storage).await?;
        let mut download = storage
            .download_stream(to_mtp_handle(handle))
            .await
            .map_err(map_transport_error)?;

        let mut sent = 0u64;
        while let Some(chunk) = download.next_chunk().await {
            let chunk = chunk.map_err(map_transport_error)?;
            let len = chunk.len() as u64;
            if sink.send(Ok(chunk)).await.is_err() {
                // Receiver gone: the caller abandoned the download.
                debug!("Download consumer dropped after {} bytes", sent);
                return Ok(sent);
            }
            sent += len;
        }
        Ok(sent)
    }

    async fn upload(
        &mut self,
        storage: StorageId,
        parent: ObjectHandle,
        name: &str,
        total_size: u64,
        source: mpsc::Receiver<Bytes>,
    ) -> Result<ObjectHandle, ProtocolFailure> {
        let storage = self.storage(storage).await?;
        let object_info = NewObjectInfo::file(name, total_size);
        // ReceiverStream is Unpin, which the transport's upload requires.
        let data_stream = ReceiverStream::new(source).map(Ok::<_, std::io::Error>);
        let handle = storage
            .upload(to_parent_option(parent), object_info, data_stream)
            .await
            .map_err(|e| {
                warn!("Upload of {} failed: {:?}", name, e);
                map_transport_error(e)
            })?;
        Ok(ObjectHandle(handle.0))
    }

    async fn close(&mut self) {
        // Dropping the device closes the session; nothing explicit to do.
    }
}

fn parse_location_id(device_id: &str) -> Option<u64> {
    device_id.strip_prefix(DEVICE_ID_PREFIX)?.parse().ok()
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn to_mtp_handle(handle: ObjectHandle) -> mtp_rs::ObjectHandle {
    if handle == ObjectHandle::ROOT {
        mtp_rs::ObjectHandle::ROOT
    } else {
        mtp_rs::ObjectHandle(handle.0)
    }
}

fn to_parent_option(parent: ObjectHandle) -> Option<mtp_rs::ObjectHandle> {
    if parent == ObjectHandle::ROOT {
        None
    } else {
        Some(mtp_rs::ObjectHandle(parent.0))
    }
}

fn convert_object_info(info: mtp_rs::ptp::ObjectInfo) -> ObjectInfo {
    let is_dir = info.format == ObjectFormatCode::Association;
    ObjectInfo {
        handle: ObjectHandle(info.handle.0),
        name: info.filename.clone(),
        kind: if is_dir {
            ObjectKind::Folder
        } else {
            ObjectKind::File
        },
        size: if is_dir { 0 } else { info.size },
        modified_at: info.modified.map(datetime_to_unix),
    }
}

/// Converts a protocol datetime to Unix seconds. Month lengths and leap
/// years are approximated; listing-grade precision is all that is needed.
fn datetime_to_unix(dt: mtp_rs::ptp::DateTime) -> i64 {
    let year = dt.year as i64;
    let years_since_1970 = (year - 1970).max(0);
    let days = years_since_1970 * 365
        + years_since_1970 / 4
        + (dt.month as i64 - 1).max(0) * 30
        + (dt.day as i64 - 1).max(0);
    days * 86400 + dt.hour as i64 * 3600 + dt.minute as i64 * 60 + dt.second as i64
}

fn map_transport_error(e: mtp_rs::Error) -> ProtocolFailure {
    match e {
        mtp_rs::Error::NoDevice | mtp_rs::Error::Disconnected | mtp_rs::Error::SessionNotOpen => {
            ProtocolFailure::Disconnected
        }
        mtp_rs::Error::Timeout => ProtocolFailure::Timeout,
        mtp_rs::Error::Cancelled => ProtocolFailure::TransferAborted,
        mtp_rs::Error::Protocol { code, operation } => match code {
            ResponseCode::DeviceBusy => ProtocolFailure::Busy,
            ResponseCode::StoreFull => ProtocolFailure::StorageFull,
            ResponseCode::StoreReadOnly => ProtocolFailure::ReadOnly,
            ResponseCode::InvalidObjectHandle | ResponseCode::InvalidParentObject => {
                ProtocolFailure::NotFound
            }
            ResponseCode::AccessDenied => ProtocolFailure::AccessDenied,
            other => ProtocolFailure::Protocol(format!("{:?} during {:?}", other, operation)),
        },
        mtp_rs::Error::InvalidData { message } => ProtocolFailure::InvalidData(message),
        mtp_rs::Error::Io(io_err) => ProtocolFailure::Protocol(format!("I/O error: {}", io_err)),
        mtp_rs::Error::Usb(usb_err) => {
            let msg = usb_err.to_string();
            let lowered = msg.to_lowercase();
            if lowered.contains("exclusive access") || lowered.contains("device or resource busy") {
                ProtocolFailure::ExclusiveAccess { owner_hint: None }
            } else {
                ProtocolFailure::Protocol(format!("USB error: {}", msg))
            }
        }
    }
}
