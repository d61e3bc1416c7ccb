//! Streaming file transfer in and out of device storages.
//!
//! Downloads hand back a [`DownloadStream`] whose total size is known
//! before the first chunk. Uploads go through an [`UploadSink`] fed chunk
//! by chunk against a declared total size. Both sides ride bounded
//! channels, so memory in flight never exceeds the configured look-ahead
//! regardless of file size.

use std::path::PathBuf;
use std::path::Path;

use bytes::Bytes;
use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

use super::worker::Command;
use super::{
    map_protocol_failure, normalize_device_path, DeviceError, DeviceSessionManager, ObjectHandle,
    ObjectInfo, ObjectKind, ProtocolFailure, StorageId,
};

impl DeviceSessionManager {
    /// Opens a streaming download of one file.
    ///
    /// Occupies the device's worker until the stream is fully consumed or
    /// dropped; queue further commands for the same device only after
    /// finishing with the stream.
    pub fn open_download(
        &self,
        device_id: &str,
        storage: StorageId,
        path: &Path,
    ) -> Result<DownloadStream, DeviceError> {
        let path = normalize_device_path(path);
        let session = self.session(device_id)?;
        let handle = self.resolve_in_session(&session, device_id, storage, &path)?;
        let lookahead = self.stream_lookahead();

        let (total_size, chunks) =
            self.submit(&session, device_id, &path.to_string_lossy(), |reply| {
                Command::Download {
                    storage,
                    handle,
                    lookahead,
                    reply,
                }
            })?;

        debug!(
            "Download stream open for {:?} on {} ({} bytes)",
            path, device_id, total_size
        );
        Ok(DownloadStream {
            device_id: device_id.to_string(),
            path: path.to_string_lossy().to_string(),
            total_size,
            bytes_read: 0,
            chunks,
            done: false,
        })
    }

    /// Begins a streaming upload of exactly `total_size` bytes to `dest`.
    ///
    /// Fails before any byte moves when the target storage is read-only.
    /// The upload completes only when [`UploadSink::finish`] is called
    /// after pushing the declared number of bytes; dropping the sink midway
    /// aborts the transfer on the device side.
    pub fn begin_upload(
        &self,
        device_id: &str,
        storage: StorageId,
        dest: &Path,
        total_size: u64,
    ) -> Result<UploadSink<'_>, DeviceError> {
        let dest = normalize_device_path(dest);
        let session = self.session(device_id)?;
        match session.storage(storage) {
            Some(info) if info.read_only => {
                return Err(DeviceError::ReadOnlyStorage {
                    device_id: device_id.to_string(),
                })
            }
            Some(_) => {}
            None => {
                return Err(DeviceError::NotFound {
                    device_id: device_id.to_string(),
                    path: format!("storage {}", storage.0),
                })
            }
        }

        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DeviceError::Other {
                device_id: device_id.to_string(),
                message: "upload destination has no file name".to_string(),
            })?;
        let parent = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let parent_handle = self.resolve_in_session(&session, device_id, storage, &parent)?;

        let (chunk_tx, chunk_rx) = mpsc::channel(self.stream_lookahead().max(1));
        let (reply_tx, done) = oneshot::channel();
        session
            .commands
            .blocking_send(Command::Upload {
                storage,
                parent: parent_handle,
                name: name.clone(),
                total_size,
                source: chunk_rx,
                reply: reply_tx,
            })
            .map_err(|_| DeviceError::Disconnected {
                device_id: device_id.to_string(),
            })?;

        debug!(
            "Upload sink open for {:?} on {} ({} bytes)",
            dest, device_id, total_size
        );
        Ok(UploadSink {
            manager: self,
            session,
            device_id: device_id.to_string(),
            storage,
            dest,
            parent,
            name,
            total_size,
            bytes_sent: 0,
            chunk_tx: Some(chunk_tx),
            done: Some(done),
        })
    }
}

/// Ordered chunk stream of one file download.
pub struct DownloadStream {
    device_id: String,
    path: String,
    total_size: u64,
    bytes_read: u64,
    chunks: super::protocol::ChunkReceiver,
    done: bool,
}

impl DownloadStream {
    /// File size, known before the first chunk.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Next chunk, in order; `None` at end of file. Blocks the calling
    /// thread while the device produces.
    pub fn next_chunk(&mut self) -> Option<Result<Bytes, DeviceError>> {
        if self.done {
            return None;
        }
        match self.chunks.blocking_recv() {
            None => {
                self.done = true;
                None
            }
            Some(Ok(chunk)) => {
                self.bytes_read += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Some(Err(failure)) => {
                self.done = true;
                Some(Err(map_protocol_failure(
                    failure,
                    &self.device_id,
                    &self.path,
                )))
            }
        }
    }
}

/// Chunk-by-chunk upload of one file with a declared size.
pub struct UploadSink<'a> {
    manager: &'a DeviceSessionManager,
    session: std::sync::Arc<super::DeviceSession>,
    device_id: String,
    storage: StorageId,
    dest: PathBuf,
    parent: PathBuf,
    name: String,
    total_size: u64,
    bytes_sent: u64,
    chunk_tx: Option<mpsc::Sender<Bytes>>,
    done: Option<oneshot::Receiver<Result<ObjectHandle, ProtocolFailure>>>,
}

impl UploadSink<'_> {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Pushes the next chunk. Blocks when the device is behind by more
    /// than the configured look-ahead.
    pub fn push(&mut self, chunk: Bytes) -> Result<(), DeviceError> {
        let tx = self.chunk_tx.as_ref().ok_or_else(|| DeviceError::Other {
            device_id: self.device_id.clone(),
            message: "upload already finished".to_string(),
        })?;
        if self.bytes_sent + chunk.len() as u64 > self.total_size {
            return Err(DeviceError::Other {
                device_id: self.device_id.clone(),
                message: format!(
                    "upload exceeds declared size of {} bytes",
                    self.total_size
                ),
            });
        }
        let len = chunk.len() as u64;
        if tx.blocking_send(chunk).is_err() {
            // The worker bailed out; surface its real failure.
            return Err(self.wait_done().err().unwrap_or_else(|| DeviceError::Other {
                device_id: self.device_id.clone(),
                message: "upload stopped unexpectedly".to_string(),
            }));
        }
        self.bytes_sent += len;
        Ok(())
    }

    /// Completes the upload. Fails if fewer bytes than declared were
    /// pushed. On success the new file is immediately resolvable and the
    /// parent listing is refreshed on next read.
    pub fn finish(mut self) -> Result<ObjectInfo, DeviceError> {
        if self.bytes_sent != self.total_size {
            let sent = self.bytes_sent;
            self.abort_inner();
            return Err(DeviceError::Other {
                device_id: self.device_id.clone(),
                message: format!(
                    "upload ended after {} of {} bytes",
                    sent, self.total_size
                ),
            });
        }
        // Closing the chunk channel is the end-of-stream signal.
        self.chunk_tx = None;
        let handle = self.wait_done()?;

        self.session
            .with_path_cache(self.storage, |c| c.insert(self.dest.clone(), handle));
        self.session
            .with_listing_cache(self.storage, |c| c.invalidate(&self.parent));
        info!(
            "Uploaded {:?} to {} ({} bytes)",
            self.dest, self.device_id, self.total_size
        );
        Ok(ObjectInfo {
            handle,
            name: self.name.clone(),
            kind: ObjectKind::File,
            size: self.total_size,
            modified_at: None,
        })
    }

    /// Abandons the upload. The device-side partial object, if any, is the
    /// worker's to reject; the parent listing is invalidated either way.
    pub fn abort(mut self) {
        debug!("Upload of {:?} to {} aborted", self.dest, self.device_id);
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        self.chunk_tx = None;
        let _ = self.wait_done();
        self.session
            .with_listing_cache(self.storage, |c| c.invalidate(&self.parent));
    }

    fn wait_done(&mut self) -> Result<ObjectHandle, DeviceError> {
        let done = self.done.take().ok_or_else(|| DeviceError::Other {
            device_id: self.device_id.clone(),
            message: "upload result already consumed".to_string(),
        })?;
        self.manager
            .await_reply(done, &self.device_id, &self.dest.to_string_lossy())
    }
}

impl Drop for UploadSink<'_> {
    fn drop(&mut self) {
        if self.done.is_some() {
            // Not finished and not aborted: tear the transfer down so the
            // worker does not wait on a closed channel forever.
            self.abort_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::FakeDeviceTree;
    use super::super::DeviceIdentity;
    use super::*;
    use crate::config::SessionConfig;

    fn setup() -> (DeviceSessionManager, FakeDeviceTree, StorageId) {
        let manager = DeviceSessionManager::new(SessionConfig::default()).unwrap();
        let tree = FakeDeviceTree::new();
        manager.device_appeared(DeviceIdentity {
            id: "device-1".to_string(),
            vendor_id: 1,
            product_id: 2,
            manufacturer: None,
            product: None,
            serial_number: None,
        });
        manager.open_session("device-1", &tree.opener()).unwrap();
        let storage = tree.storage_id();
        (manager, tree, storage)
    }

    #[test]
    fn test_download_streams_whole_file_in_order() {
        let (manager, tree, storage) = setup();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tree.add_file("/Music/song.mp3", data.clone());

        let mut stream = manager
            .open_download("device-1", storage, Path::new("/Music/song.mp3"))
            .unwrap();
        assert_eq!(stream.total_size(), data.len() as u64);

        let mut received = Vec::new();
        while let Some(chunk) = stream.next_chunk() {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, data);
        assert_eq!(stream.bytes_read(), data.len() as u64);
    }

    #[test]
    fn test_download_missing_file_fails_before_streaming() {
        let (manager, _tree, storage) = setup();
        let err = manager
            .open_download("device-1", storage, Path::new("/nope.bin"))
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::NotFound { .. }));
    }

    #[test]
    fn test_upload_round_trip() {
        let (manager, tree, storage) = setup();
        tree.add_folder("/Imports");
        let data = vec![42u8; 150_000];

        let mut sink = manager
            .begin_upload(
                "device-1",
                storage,
                Path::new("/Imports/blob.bin"),
                data.len() as u64,
            )
            .unwrap();
        for chunk in data.chunks(32 * 1024) {
            sink.push(Bytes::copy_from_slice(chunk)).unwrap();
        }
        let info = sink.finish().unwrap();
        assert_eq!(info.size, data.len() as u64);

        assert_eq!(tree.file_data("/Imports/blob.bin").unwrap(), data);
        // Immediately resolvable without a fresh listing.
        let resolved = manager
            .resolve_path("device-1", storage, Path::new("/Imports/blob.bin"))
            .unwrap();
        assert_eq!(resolved, info.handle);
    }

    #[test]
    fn test_upload_to_read_only_storage_fails_before_bytes() {
        let (manager, tree, storage) = setup();
        // Read-only is reported at session open, so flag it before opening.
        let manager2 = DeviceSessionManager::new(SessionConfig::default()).unwrap();
        tree.set_read_only(true);
        manager2.device_appeared(DeviceIdentity {
            id: "device-ro".to_string(),
            vendor_id: 1,
            product_id: 2,
            manufacturer: None,
            product: None,
            serial_number: None,
        });
        manager2.open_session("device-ro", &tree.opener()).unwrap();
        drop(manager);

        let err = manager2
            .begin_upload("device-ro", storage, Path::new("/x.bin"), 10)
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::ReadOnlyStorage { .. }));
        assert_eq!(tree.lookup("/x.bin"), None);
    }

    #[test]
    fn test_short_upload_fails_on_finish() {
        let (manager, tree, storage) = setup();
        let mut sink = manager
            .begin_upload("device-1", storage, Path::new("/short.bin"), 1000)
            .unwrap();
        sink.push(Bytes::from_static(&[1, 2, 3])).unwrap();
        let err = sink.finish().unwrap_err();
        assert!(matches!(err, DeviceError::Other { .. }));
        assert!(tree.lookup("/short.bin").is_none());
    }

    #[test]
    fn test_oversized_push_is_rejected() {
        let (manager, _tree, storage) = setup();
        let mut sink = manager
            .begin_upload("device-1", storage, Path::new("/tiny.bin"), 2)
            .unwrap();
        let err = sink.push(Bytes::from_static(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, DeviceError::Other { .. }));
        sink.abort();
    }

    #[test]
    fn test_aborted_upload_leaves_no_object() {
        let (manager, tree, storage) = setup();
        let mut sink = manager
            .begin_upload("device-1", storage, Path::new("/partial.bin"), 1_000_000)
            .unwrap();
        sink.push(Bytes::from(vec![0u8; 64 * 1024])).unwrap();
        sink.abort();
        assert!(tree.lookup("/partial.bin").is_none());
    }
}
