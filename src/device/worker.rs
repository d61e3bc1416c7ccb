//! Per-device command worker.
//!
//! Each open session spawns exactly one worker task that owns the
//! [`ProtocolClient`]. Every operation is a [`Command`] on the worker's
//! queue, executed strictly in submission order, so at most one protocol
//! operation is ever in flight per device. Streaming commands occupy the
//! worker for their whole duration; their chunk channels are bounded, which
//! is what keeps transfer memory flat.

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use super::protocol::{
    ChunkReceiver, ObjectHandle, ObjectInfo, ProtocolClient, ProtocolFailure, StorageId,
    StorageInfo,
};

pub(super) enum Command {
    Storages {
        reply: oneshot::Sender<Result<Vec<StorageInfo>, ProtocolFailure>>,
    },
    ListChildren {
        storage: StorageId,
        parent: ObjectHandle,
        reply: oneshot::Sender<Result<Vec<ObjectInfo>, ProtocolFailure>>,
    },
    ObjectInfo {
        storage: StorageId,
        handle: ObjectHandle,
        reply: oneshot::Sender<Result<ObjectInfo, ProtocolFailure>>,
    },
    CreateFolder {
        storage: StorageId,
        parent: ObjectHandle,
        name: String,
        reply: oneshot::Sender<Result<ObjectHandle, ProtocolFailure>>,
    },
    Delete {
        storage: StorageId,
        handle: ObjectHandle,
        reply: oneshot::Sender<Result<(), ProtocolFailure>>,
    },
    Rename {
        storage: StorageId,
        handle: ObjectHandle,
        new_name: String,
        reply: oneshot::Sender<Result<(), ProtocolFailure>>,
    },
    MoveObject {
        storage: StorageId,
        handle: ObjectHandle,
        new_parent: ObjectHandle,
        reply: oneshot::Sender<Result<(), ProtocolFailure>>,
    },
    /// Replies with `(total_size, chunk_receiver)` before any chunk moves,
    /// then drives the download to completion (or until the receiver is
    /// dropped).
    Download {
        storage: StorageId,
        handle: ObjectHandle,
        lookahead: usize,
        reply: oneshot::Sender<Result<(u64, ChunkReceiver), ProtocolFailure>>,
    },
    /// Consumes `source` until `total_size` bytes arrived, then replies with
    /// the new object's handle. The reply stays pending for the whole
    /// upload.
    Upload {
        storage: StorageId,
        parent: ObjectHandle,
        name: String,
        total_size: u64,
        source: mpsc::Receiver<Bytes>,
        reply: oneshot::Sender<Result<ObjectHandle, ProtocolFailure>>,
    },
    Close,
}

pub(super) async fn run(
    device_id: String,
    mut client: Box<dyn ProtocolClient>,
    mut commands: mpsc::Receiver<Command>,
) {
    debug!("Worker started for device {}", device_id);

    while let Some(command) = commands.recv().await {
        match command {
            Command::Storages { reply } => {
                let _ = reply.send(client.storages().await);
            }
            Command::ListChildren {
                storage,
                parent,
                reply,
            } => {
                let _ = reply.send(client.list_children(storage, parent).await);
            }
            Command::ObjectInfo {
                storage,
                handle,
                reply,
            } => {
                let _ = reply.send(client.object_info(storage, handle).await);
            }
            Command::CreateFolder {
                storage,
                parent,
                name,
                reply,
            } => {
                let _ = reply.send(client.create_folder(storage, parent, &name).await);
            }
            Command::Delete {
                storage,
                handle,
                reply,
            } => {
                let _ = reply.send(client.delete(storage, handle).await);
            }
            Command::Rename {
                storage,
                handle,
                new_name,
                reply,
            } => {
                let _ = reply.send(client.rename(storage, handle, &new_name).await);
            }
            Command::MoveObject {
                storage,
                handle,
                new_parent,
                reply,
            } => {
                let _ = reply.send(client.move_object(storage, handle, new_parent).await);
            }
            Command::Download {
                storage,
                handle,
                lookahead,
                reply,
            } => {
                // Size must be known before the first chunk so callers can
                // report totals up front.
                match client.object_info(storage, handle).await {
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                    Ok(info) => {
                        let (tx, rx) = mpsc::channel(lookahead.max(1));
                        if reply.send(Ok((info.size, rx))).is_err() {
                            debug!("Download caller went away before start");
                            continue;
                        }
                        match client.download(storage, handle, tx.clone()).await {
                            Ok(bytes) => {
                                debug!(
                                    "Download of handle {} complete ({} bytes)",
                                    handle.0, bytes
                                );
                            }
                            Err(e) => {
                                warn!("Download of handle {} failed: {}", handle.0, e);
                                // Surface the failure in-band; the receiver
                                // may already be gone, which is fine.
                                let _ = tx.send(Err(e)).await;
                            }
                        }
                    }
                }
            }
            Command::Upload {
                storage,
                parent,
                name,
                total_size,
                source,
                reply,
            } => {
                let result = client
                    .upload(storage, parent, &name, total_size, source)
                    .await;
                if let Err(e) = &result {
                    warn!("Upload of {} failed: {}", name, e);
                }
                let _ = reply.send(result);
            }
            Command::Close => {
                client.close().await;
                break;
            }
        }
    }

    debug!("Worker stopped for device {}", device_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDeviceTree;

    #[tokio::test]
    async fn test_commands_execute_in_submission_order() {
        let tree = FakeDeviceTree::new();
        let storage = tree.storage_id();
        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(run("device-test".to_string(), tree.client(), rx));

        // Queue two folder creations and a listing; the listing must see
        // both folders because it runs after them.
        let (r1, r1_rx) = oneshot::channel();
        let (r2, r2_rx) = oneshot::channel();
        let (r3, r3_rx) = oneshot::channel();
        tx.send(Command::CreateFolder {
            storage,
            parent: ObjectHandle::ROOT,
            name: "first".to_string(),
            reply: r1,
        })
        .await
        .unwrap();
        tx.send(Command::CreateFolder {
            storage,
            parent: ObjectHandle::ROOT,
            name: "second".to_string(),
            reply: r2,
        })
        .await
        .unwrap();
        tx.send(Command::ListChildren {
            storage,
            parent: ObjectHandle::ROOT,
            reply: r3,
        })
        .await
        .unwrap();

        r1_rx.await.unwrap().unwrap();
        r2_rx.await.unwrap().unwrap();
        let children = r3_rx.await.unwrap().unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"first"));
        assert!(names.contains(&"second"));

        tx.send(Command::Close).await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_download_replies_with_size_before_chunks() {
        let tree = FakeDeviceTree::new();
        let storage = tree.storage_id();
        let handle = tree.add_file("/photo.jpg", vec![7u8; 1000]);

        let (tx, rx) = mpsc::channel(8);
        let worker = tokio::spawn(run("device-test".to_string(), tree.client(), rx));

        let (reply, reply_rx) = oneshot::channel();
        tx.send(Command::Download {
            storage,
            handle,
            lookahead: 2,
            reply,
        })
        .await
        .unwrap();

        let (size, mut chunks) = reply_rx.await.unwrap().unwrap();
        assert_eq!(size, 1000);

        let mut total = 0u64;
        while let Some(chunk) = chunks.recv().await {
            total += chunk.unwrap().len() as u64;
        }
        assert_eq!(total, 1000);

        tx.send(Command::Close).await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_closes() {
        let tree = FakeDeviceTree::new();
        let (tx, rx) = mpsc::channel::<Command>(1);
        let worker = tokio::spawn(run("device-test".to_string(), tree.client(), rx));
        drop(tx);
        worker.await.unwrap();
    }
}
