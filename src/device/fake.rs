//! In-memory protocol fake for tests.
//!
//! `FakeDeviceTree` is a shared object tree; `client()` hands out a
//! [`ProtocolClient`] view of it and `opener()` a [`DeviceOpener`] so the
//! session manager can be exercised end to end without hardware. Failure
//! injection covers the cases the manager must survive: refused opens and
//! mid-operation disconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::protocol::{
    ChunkSender, DeviceIdentity, DeviceOpener, ObjectHandle, ObjectInfo, ObjectKind, OpenedDevice,
    ProtocolClient, ProtocolFailure, StorageId, StorageInfo,
};

const FAKE_STORAGE_ID: u32 = 0x0001_0001;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: ObjectKind,
    parent: Option<u32>,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct TreeState {
    nodes: HashMap<u32, Node>,
    next_handle: u32,
}

impl TreeState {
    fn children_of(&self, parent: Option<u32>) -> Vec<(u32, Node)> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.parent == parent)
            .map(|(h, n)| (*h, n.clone()))
            .collect()
    }

    fn child_by_name(&self, parent: Option<u32>, name: &str) -> Option<u32> {
        self.nodes
            .iter()
            .find(|(_, n)| n.parent == parent && n.name == name)
            .map(|(h, _)| *h)
    }

    fn insert(&mut self, node: Node) -> u32 {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.nodes.insert(handle, node);
        handle
    }
}

/// Shared fake device: an object tree plus failure switches.
#[derive(Clone)]
pub(crate) struct FakeDeviceTree {
    state: Arc<Mutex<TreeState>>,
    disconnected: Arc<AtomicBool>,
    read_only: Arc<AtomicBool>,
    op_count: Arc<AtomicU64>,
    chunk_size: usize,
}

impl FakeDeviceTree {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TreeState::default())),
            disconnected: Arc::new(AtomicBool::new(false)),
            read_only: Arc::new(AtomicBool::new(false)),
            op_count: Arc::new(AtomicU64::new(0)),
            chunk_size: 64 * 1024,
        }
    }

    pub fn storage_id(&self) -> StorageId {
        StorageId(FAKE_STORAGE_ID)
    }

    /// Flip the device into a disconnected state; every subsequent protocol
    /// call fails with `Disconnected`.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of protocol calls served so far. Lets tests assert that a
    /// cached answer made no device round trip.
    pub fn op_count(&self) -> u64 {
        self.op_count.load(Ordering::SeqCst)
    }

    /// Creates a file at `path` (intermediate folders created as needed).
    pub fn add_file(&self, path: &str, data: Vec<u8>) -> ObjectHandle {
        self.add_node(path, ObjectKind::File, data)
    }

    /// Creates a folder at `path` (intermediate folders created as needed).
    pub fn add_folder(&self, path: &str) -> ObjectHandle {
        self.add_node(path, ObjectKind::Folder, Vec::new())
    }

    fn add_node(&self, path: &str, kind: ObjectKind, data: Vec<u8>) -> ObjectHandle {
        let mut state = self.state.lock().unwrap();
        let mut parent: Option<u32> = None;
        let components: Vec<&str> = path.trim_matches('/').split('/').collect();
        let (last, folders) = components.split_last().expect("non-empty path");
        for segment in folders {
            parent = Some(match state.child_by_name(parent, segment) {
                Some(h) => h,
                None => state.insert(Node {
                    name: segment.to_string(),
                    kind: ObjectKind::Folder,
                    parent,
                    data: Vec::new(),
                }),
            });
        }
        let handle = state.insert(Node {
            name: last.to_string(),
            kind,
            parent,
            data,
        });
        ObjectHandle(handle)
    }

    /// Looks a path up by walking names. `None` when missing.
    pub fn lookup(&self, path: &str) -> Option<ObjectHandle> {
        let state = self.state.lock().unwrap();
        let mut parent: Option<u32> = None;
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Some(ObjectHandle::ROOT);
        }
        for segment in trimmed.split('/') {
            parent = Some(state.child_by_name(parent, segment)?);
        }
        parent.map(ObjectHandle)
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        let handle = self.lookup(path)?;
        let state = self.state.lock().unwrap();
        state.nodes.get(&handle.0).map(|n| n.data.clone())
    }

    pub fn client(&self) -> Box<dyn ProtocolClient> {
        Box::new(FakeClient { tree: self.clone() })
    }

    pub fn opener(&self) -> FakeOpener {
        FakeOpener {
            tree: self.clone(),
            open_failure: Arc::new(Mutex::new(None)),
            open_delay: Arc::new(Mutex::new(None)),
            open_count: Arc::new(AtomicU64::new(0)),
        }
    }

    fn check_connected(&self) -> Result<(), ProtocolFailure> {
        self.op_count.fetch_add(1, Ordering::SeqCst);
        if self.disconnected.load(Ordering::SeqCst) {
            Err(ProtocolFailure::Disconnected)
        } else {
            Ok(())
        }
    }

    fn to_parent_key(handle: ObjectHandle) -> Option<u32> {
        if handle == ObjectHandle::ROOT {
            None
        } else {
            Some(handle.0)
        }
    }
}

struct FakeClient {
    tree: FakeDeviceTree,
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn storages(&mut self) -> Result<Vec<StorageInfo>, ProtocolFailure> {
        self.tree.check_connected()?;
        Ok(vec![StorageInfo {
            id: FAKE_STORAGE_ID,
            name: "Internal shared storage".to_string(),
            total_bytes: 8 * 1024 * 1024 * 1024,
            available_bytes: 4 * 1024 * 1024 * 1024,
            read_only: self.tree.read_only.load(Ordering::SeqCst),
        }])
    }

    async fn list_children(
        &mut self,
        _storage: StorageId,
        parent: ObjectHandle,
    ) -> Result<Vec<ObjectInfo>, ProtocolFailure> {
        self.tree.check_connected()?;
        let key = FakeDeviceTree::to_parent_key(parent);
        let state = self.tree.state.lock().unwrap();
        if key.is_some() && !state.nodes.contains_key(&key.unwrap()) {
            return Err(ProtocolFailure::NotFound);
        }
        Ok(state
            .children_of(key)
            .into_iter()
            .map(|(h, n)| ObjectInfo {
                handle: ObjectHandle(h),
                name: n.name,
                kind: n.kind,
                size: n.data.len() as u64,
                modified_at: None,
            })
            .collect())
    }

    async fn object_info(
        &mut self,
        _storage: StorageId,
        handle: ObjectHandle,
    ) -> Result<ObjectInfo, ProtocolFailure> {
        self.tree.check_connected()?;
        let state = self.tree.state.lock().unwrap();
        let node = state.nodes.get(&handle.0).ok_or(ProtocolFailure::NotFound)?;
        Ok(ObjectInfo {
            handle,
            name: node.name.clone(),
            kind: node.kind,
            size: node.data.len() as u64,
            modified_at: None,
        })
    }

    async fn create_folder(
        &mut self,
        _storage: StorageId,
        parent: ObjectHandle,
        name: &str,
    ) -> Result<ObjectHandle, ProtocolFailure> {
        self.tree.check_connected()?;
        if self.tree.read_only.load(Ordering::SeqCst) {
            return Err(ProtocolFailure::ReadOnly);
        }
        let key = FakeDeviceTree::to_parent_key(parent);
        let mut state = self.tree.state.lock().unwrap();
        if state.child_by_name(key, name).is_some() {
            return Err(ProtocolFailure::Protocol("name already exists".to_string()));
        }
        Ok(ObjectHandle(state.insert(Node {
            name: name.to_string(),
            kind: ObjectKind::Folder,
            parent: key,
            data: Vec::new(),
        })))
    }

    async fn delete(
        &mut self,
        _storage: StorageId,
        handle: ObjectHandle,
    ) -> Result<(), ProtocolFailure> {
        self.tree.check_connected()?;
        let mut state = self.tree.state.lock().unwrap();
        let node = state.nodes.get(&handle.0).ok_or(ProtocolFailure::NotFound)?;
        if node.kind == ObjectKind::Folder && !state.children_of(Some(handle.0)).is_empty() {
            return Err(ProtocolFailure::Protocol("folder not empty".to_string()));
        }
        state.nodes.remove(&handle.0);
        Ok(())
    }

    async fn rename(
        &mut self,
        _storage: StorageId,
        handle: ObjectHandle,
        new_name: &str,
    ) -> Result<(), ProtocolFailure> {
        self.tree.check_connected()?;
        let mut state = self.tree.state.lock().unwrap();
        let node = state
            .nodes
            .get_mut(&handle.0)
            .ok_or(ProtocolFailure::NotFound)?;
        node.name = new_name.to_string();
        Ok(())
    }

    async fn move_object(
        &mut self,
        _storage: StorageId,
        handle: ObjectHandle,
        new_parent: ObjectHandle,
    ) -> Result<(), ProtocolFailure> {
        self.tree.check_connected()?;
        let key = FakeDeviceTree::to_parent_key(new_parent);
        let mut state = self.tree.state.lock().unwrap();
        if let Some(parent_key) = key {
            match state.nodes.get(&parent_key) {
                Some(n) if n.kind == ObjectKind::Folder => {}
                _ => return Err(ProtocolFailure::NotFound),
            }
        }
        let node = state
            .nodes
            .get_mut(&handle.0)
            .ok_or(ProtocolFailure::NotFound)?;
        node.parent = key;
        Ok(())
    }

    async fn download(
        &mut self,
        _storage: StorageId,
        handle: ObjectHandle,
        sink: ChunkSender,
    ) -> Result<u64, ProtocolFailure> {
        self.tree.check_connected()?;
        let data = {
            let state = self.tree.state.lock().unwrap();
            state
                .nodes
                .get(&handle.0)
                .ok_or(ProtocolFailure::NotFound)?
                .data
                .clone()
        };
        let mut sent = 0u64;
        for chunk in data.chunks(self.tree.chunk_size) {
            if self.tree.disconnected.load(Ordering::SeqCst) {
                return Err(ProtocolFailure::Disconnected);
            }
            if sink.send(Ok(Bytes::copy_from_slice(chunk))).await.is_err() {
                // Receiver gone; the caller abandoned the download.
                return Ok(sent);
            }
            sent += chunk.len() as u64;
        }
        Ok(sent)
    }

    async fn upload(
        &mut self,
        _storage: StorageId,
        parent: ObjectHandle,
        name: &str,
        total_size: u64,
        mut source: mpsc::Receiver<Bytes>,
    ) -> Result<ObjectHandle, ProtocolFailure> {
        self.tree.check_connected()?;
        if self.tree.read_only.load(Ordering::SeqCst) {
            return Err(ProtocolFailure::ReadOnly);
        }
        let mut data = Vec::with_capacity(total_size.min(16 * 1024 * 1024) as usize);
        while (data.len() as u64) < total_size {
            if self.tree.disconnected.load(Ordering::SeqCst) {
                return Err(ProtocolFailure::Disconnected);
            }
            match source.recv().await {
                Some(chunk) => data.extend_from_slice(&chunk),
                None => return Err(ProtocolFailure::TransferAborted),
            }
        }
        if data.len() as u64 != total_size {
            return Err(ProtocolFailure::InvalidData(format!(
                "expected {} bytes, got {}",
                total_size,
                data.len()
            )));
        }

        let key = FakeDeviceTree::to_parent_key(parent);
        let mut state = self.tree.state.lock().unwrap();
        if let Some(existing) = state.child_by_name(key, name) {
            state.nodes.remove(&existing);
        }
        Ok(ObjectHandle(state.insert(Node {
            name: name.to_string(),
            kind: ObjectKind::File,
            parent: key,
            data,
        })))
    }

    async fn close(&mut self) {}
}

/// Opener over a [`FakeDeviceTree`], with injectable open failures and an
/// optional delay for racing concurrent opens.
pub(crate) struct FakeOpener {
    tree: FakeDeviceTree,
    open_failure: Arc<Mutex<Option<ProtocolFailure>>>,
    open_delay: Arc<Mutex<Option<std::time::Duration>>>,
    open_count: Arc<AtomicU64>,
}

impl FakeOpener {
    /// The next (and every subsequent) open fails with `failure`.
    pub fn fail_with(&self, failure: ProtocolFailure) {
        *self.open_failure.lock().unwrap() = Some(failure);
    }

    pub fn clear_failure(&self) {
        *self.open_failure.lock().unwrap() = None;
    }

    /// Every open sleeps this long before completing.
    pub fn delay_opens(&self, delay: std::time::Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    /// How many times `open` actually ran.
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceOpener for FakeOpener {
    async fn open(&self, device_id: &str) -> Result<OpenedDevice, ProtocolFailure> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = self.open_failure.lock().unwrap().clone() {
            return Err(failure);
        }
        if self.tree.disconnected.load(Ordering::SeqCst) {
            return Err(ProtocolFailure::Disconnected);
        }
        Ok(OpenedDevice {
            identity: DeviceIdentity {
                id: device_id.to_string(),
                vendor_id: 0x18d1,
                product_id: 0x4ee1,
                manufacturer: Some("Acme".to_string()),
                product: Some("Test Device".to_string()),
                serial_number: Some("FAKE0001".to_string()),
            },
            client: self.tree.client(),
        })
    }
}

/// Opener whose `open` never completes. Exercises the open timeout.
pub(crate) struct HangingOpener;

#[async_trait]
impl DeviceOpener for HangingOpener {
    async fn open(&self, _device_id: &str) -> Result<OpenedDevice, ProtocolFailure> {
        futures_util::future::pending().await
    }
}
