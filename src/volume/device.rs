//! Volume view of one storage on a removable device.
//!
//! `DeviceVolume` adapts the session manager's path-based operations to the
//! uniform [`Volume`] contract. It holds no protocol state of its own;
//! every call rides the device's worker queue, and the blocking happens on
//! the caller's thread.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use super::{CopyScanResult, FileEntry, SpaceInfo, Volume, VolumeError, VolumeReadStream};
use crate::device::{
    DeviceError, DeviceSessionManager, DownloadStream, ObjectInfo, StorageId,
};

/// Read/upload granularity when bridging device streams to local files.
const FILE_CHUNK_SIZE: usize = 1024 * 1024;

pub struct DeviceVolume {
    name: String,
    device_id: String,
    storage: StorageId,
    manager: Arc<DeviceSessionManager>,
    root: PathBuf,
}

impl DeviceVolume {
    pub fn new(
        manager: Arc<DeviceSessionManager>,
        device_id: impl Into<String>,
        storage: StorageId,
        name: impl Into<String>,
    ) -> Self {
        let device_id = device_id.into();
        let root = PathBuf::from(format!("device://{}/{}", device_id, storage.0));
        Self {
            name: name.into(),
            device_id,
            storage,
            manager,
            root,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn storage_id(&self) -> StorageId {
        self.storage
    }

    /// Accepts volume-relative paths as well as fully-qualified
    /// `device://{id}/{storage}/...` paths.
    fn to_device_path(&self, path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix(&self.root) {
            return PathBuf::from("/").join(rest);
        }
        PathBuf::from("/").join(path.strip_prefix("/").unwrap_or(path))
    }

    fn entry_for(&self, parent: &Path, info: &ObjectInfo) -> FileEntry {
        let path = parent.join(&info.name);
        FileEntry {
            name: info.name.clone(),
            path: path.to_string_lossy().to_string(),
            is_directory: info.is_folder(),
            size: if info.is_folder() {
                None
            } else {
                Some(info.size)
            },
            modified: info.modified_at,
        }
    }

    fn scan_tree(&self, path: &Path, result: &mut CopyScanResult) -> Result<(), VolumeError> {
        let entries = self
            .manager
            .list(&self.device_id, self.storage, path)
            .map_err(map_device_error)?;
        for entry in entries {
            if entry.is_folder() {
                result.dir_count += 1;
                self.scan_tree(&path.join(&entry.name), result)?;
            } else {
                result.file_count += 1;
                result.total_bytes += entry.size;
            }
        }
        Ok(())
    }

    fn export_tree(&self, source: &Path, local_dest: &Path) -> Result<u64, VolumeError> {
        let info = self
            .manager
            .stat(&self.device_id, self.storage, source)
            .map_err(map_device_error)?;
        if info.is_folder() {
            std::fs::create_dir_all(local_dest)?;
            let entries = self
                .manager
                .list(&self.device_id, self.storage, source)
                .map_err(map_device_error)?;
            let mut total = 0u64;
            for entry in entries {
                total += self.export_tree(
                    &source.join(&entry.name),
                    &local_dest.join(&entry.name),
                )?;
            }
            Ok(total)
        } else {
            let mut stream = self
                .manager
                .open_download(&self.device_id, self.storage, source)
                .map_err(map_device_error)?;
            let mut file = std::fs::File::create(local_dest)?;
            while let Some(chunk) = stream.next_chunk() {
                let chunk = chunk.map_err(map_device_error)?;
                file.write_all(&chunk)?;
            }
            file.flush()?;
            Ok(stream.bytes_read())
        }
    }

    fn import_tree(&self, local_source: &Path, dest: &Path) -> Result<u64, VolumeError> {
        let meta = std::fs::metadata(local_source)?;
        if meta.is_dir() {
            if !self.exists(dest) {
                self.create_folder(dest)?;
            }
            let mut total = 0u64;
            for entry in std::fs::read_dir(local_source)? {
                let entry = entry?;
                total += self.import_tree(&entry.path(), &dest.join(entry.file_name()))?;
            }
            Ok(total)
        } else {
            let size = meta.len();
            let mut sink = self
                .manager
                .begin_upload(&self.device_id, self.storage, dest, size)
                .map_err(map_device_error)?;
            let mut file = std::fs::File::open(local_source)?;
            let mut buf = vec![0u8; FILE_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                sink.push(Bytes::copy_from_slice(&buf[..n]))
                    .map_err(map_device_error)?;
            }
            sink.finish().map_err(map_device_error)?;
            Ok(size)
        }
    }
}

impl Volume for DeviceVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn list(&self, path: &Path) -> Result<Vec<FileEntry>, VolumeError> {
        let device_path = self.to_device_path(path);
        let entries = self
            .manager
            .list(&self.device_id, self.storage, &device_path)
            .map_err(map_device_error)?;
        Ok(entries
            .iter()
            .map(|info| self.entry_for(&device_path, info))
            .collect())
    }

    fn stat(&self, path: &Path) -> Result<FileEntry, VolumeError> {
        let device_path = self.to_device_path(path);
        let info = self
            .manager
            .stat(&self.device_id, self.storage, &device_path)
            .map_err(map_device_error)?;
        Ok(FileEntry {
            name: info.name.clone(),
            path: device_path.to_string_lossy().to_string(),
            is_directory: info.is_folder(),
            size: if info.is_folder() {
                None
            } else {
                Some(info.size)
            },
            modified: info.modified_at,
        })
    }

    fn create_folder(&self, path: &Path) -> Result<(), VolumeError> {
        self.manager
            .create_folder(&self.device_id, self.storage, &self.to_device_path(path))
            .map(|_| ())
            .map_err(map_device_error)
    }

    fn delete(&self, path: &Path) -> Result<(), VolumeError> {
        self.manager
            .delete(&self.device_id, self.storage, &self.to_device_path(path))
            .map_err(map_device_error)
    }

    fn rename(&self, path: &Path, new_name: &str) -> Result<(), VolumeError> {
        self.manager
            .rename(
                &self.device_id,
                self.storage,
                &self.to_device_path(path),
                new_name,
            )
            .map(|_| ())
            .map_err(map_device_error)
    }

    fn move_entry(&self, path: &Path, new_parent: &Path) -> Result<(), VolumeError> {
        self.manager
            .move_object(
                &self.device_id,
                self.storage,
                &self.to_device_path(path),
                &self.to_device_path(new_parent),
            )
            .map_err(map_device_error)
    }

    fn scan_for_copy(&self, path: &Path) -> Result<CopyScanResult, VolumeError> {
        let device_path = self.to_device_path(path);
        let info = self
            .manager
            .stat(&self.device_id, self.storage, &device_path)
            .map_err(map_device_error)?;
        let mut result = CopyScanResult::default();
        if info.is_folder() {
            self.scan_tree(&device_path, &mut result)?;
        } else {
            result.file_count = 1;
            result.total_bytes = info.size;
        }
        Ok(result)
    }

    fn space_info(&self) -> Result<SpaceInfo, VolumeError> {
        let session = self
            .manager
            .session_info(&self.device_id)
            .map_err(map_device_error)?;
        let storage = session
            .storages
            .iter()
            .find(|s| s.id == self.storage.0)
            .ok_or_else(|| VolumeError::NotFound {
                path: format!("storage {}", self.storage.0),
            })?;
        Ok(SpaceInfo {
            total_bytes: storage.total_bytes,
            available_bytes: storage.available_bytes,
            used_bytes: storage.total_bytes.saturating_sub(storage.available_bytes),
        })
    }

    fn export_to_local(&self, source: &Path, local_dest: &Path) -> Result<u64, VolumeError> {
        let device_path = self.to_device_path(source);
        debug!(
            "Exporting {:?} from {} to {:?}",
            device_path, self.device_id, local_dest
        );
        self.export_tree(&device_path, local_dest)
    }

    fn import_from_local(&self, local_source: &Path, dest: &Path) -> Result<u64, VolumeError> {
        let device_path = self.to_device_path(dest);
        debug!(
            "Importing {:?} to {:?} on {}",
            local_source, device_path, self.device_id
        );
        self.import_tree(local_source, &device_path)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn streaming_domain(&self) -> Option<String> {
        // All storages of one device share one worker queue.
        Some(self.device_id.clone())
    }

    fn export_streaming(&self, source: &Path) -> Result<Box<dyn VolumeReadStream>, VolumeError> {
        let stream = self
            .manager
            .open_download(&self.device_id, self.storage, &self.to_device_path(source))
            .map_err(map_device_error)?;
        Ok(Box::new(DeviceReadStream { inner: stream }))
    }

    fn import_streaming(
        &self,
        dest: &Path,
        total_size: u64,
        mut stream: Box<dyn VolumeReadStream>,
    ) -> Result<u64, VolumeError> {
        let mut sink = self
            .manager
            .begin_upload(
                &self.device_id,
                self.storage,
                &self.to_device_path(dest),
                total_size,
            )
            .map_err(map_device_error)?;
        while let Some(chunk) = stream.next_chunk() {
            match chunk {
                Ok(chunk) => sink.push(chunk).map_err(map_device_error)?,
                Err(e) => {
                    sink.abort();
                    return Err(e);
                }
            }
        }
        let written = sink.bytes_sent();
        sink.finish().map_err(map_device_error)?;
        Ok(written)
    }
}

struct DeviceReadStream {
    inner: DownloadStream,
}

impl VolumeReadStream for DeviceReadStream {
    fn next_chunk(&mut self) -> Option<Result<Bytes, VolumeError>> {
        self.inner
            .next_chunk()
            .map(|r| r.map_err(map_device_error))
    }

    fn total_size(&self) -> u64 {
        self.inner.total_size()
    }

    fn bytes_read(&self) -> u64 {
        self.inner.bytes_read()
    }
}

/// Maps session-manager errors onto the volume taxonomy.
pub(crate) fn map_device_error(e: DeviceError) -> VolumeError {
    match e {
        DeviceError::NotConnected { .. } | DeviceError::Disconnected { .. } => {
            VolumeError::Disconnected {
                detail: e.to_string(),
            }
        }
        DeviceError::ExclusiveAccess { owner_hint, .. } => {
            VolumeError::ExclusiveAccess { owner_hint }
        }
        DeviceError::Timeout { .. } => VolumeError::Timeout {
            detail: e.to_string(),
        },
        DeviceError::NotFound { path, .. } => VolumeError::NotFound { path },
        DeviceError::ReadOnlyStorage { .. } => VolumeError::PermissionDenied {
            path: e.to_string(),
        },
        DeviceError::StorageFull { .. } => VolumeError::StorageFull,
        DeviceError::NotSupported { .. } => VolumeError::NotSupported,
        DeviceError::Busy { .. } | DeviceError::Protocol { .. } => VolumeError::Protocol {
            detail: e.to_string(),
        },
        DeviceError::Other { message, .. } => VolumeError::Io { message },
    }
}
