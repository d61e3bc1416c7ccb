//! Directory operations: listing, path resolution, metadata.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use super::worker::Command;
use super::{
    normalize_device_path, DeviceError, DeviceSession, DeviceSessionManager, ObjectHandle,
    ObjectInfo, ObjectKind, StorageId,
};

/// Monotonic id correlating the log lines of one listing request.
static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

impl DeviceSessionManager {
    /// Lists a directory on a device storage, folders first, then files,
    /// both sorted case-insensitively.
    ///
    /// Serves from the listing cache when fresh. A fresh listing also
    /// populates the path cache for every entry, which is what lets
    /// [`resolve_path`](Self::resolve_path) answer child paths without
    /// another round trip.
    pub fn list(
        &self,
        device_id: &str,
        storage: StorageId,
        path: &Path,
    ) -> Result<Vec<ObjectInfo>, DeviceError> {
        let path = normalize_device_path(path);
        let request_id = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        debug!("[list #{}] {} {:?}", request_id, device_id, path);

        let session = self.session(device_id)?;
        let handle = self.resolve_in_session(&session, device_id, storage, &path)?;
        let entries = self.fetch_children(&session, device_id, storage, &path, handle)?;

        debug!(
            "[list #{}] {} entries in {:?}",
            request_id,
            entries.len(),
            started.elapsed()
        );
        Ok(entries)
    }

    /// Resolves a device path to its protocol handle.
    ///
    /// Cache-first; on a miss it walks the path segment by segment from the
    /// storage root, listing each level and populating both caches along
    /// the way. Resolution therefore works for paths that were never
    /// browsed.
    pub fn resolve_path(
        &self,
        device_id: &str,
        storage: StorageId,
        path: &Path,
    ) -> Result<ObjectHandle, DeviceError> {
        let path = normalize_device_path(path);
        let session = self.session(device_id)?;
        self.resolve_in_session(&session, device_id, storage, &path)
    }

    /// Metadata for one object. The storage root is reported as a folder.
    pub fn stat(
        &self,
        device_id: &str,
        storage: StorageId,
        path: &Path,
    ) -> Result<ObjectInfo, DeviceError> {
        let path = normalize_device_path(path);
        let session = self.session(device_id)?;
        if path == Path::new("/") {
            return Ok(ObjectInfo {
                handle: ObjectHandle::ROOT,
                name: String::new(),
                kind: ObjectKind::Folder,
                size: 0,
                modified_at: None,
            });
        }
        let handle = self.resolve_in_session(&session, device_id, storage, &path)?;
        self.submit(&session, device_id, &path.to_string_lossy(), |reply| {
            Command::ObjectInfo {
                storage,
                handle,
                reply,
            }
        })
    }

    pub(super) fn resolve_in_session(
        &self,
        session: &Arc<DeviceSession>,
        device_id: &str,
        storage: StorageId,
        path: &Path,
    ) -> Result<ObjectHandle, DeviceError> {
        if let Some(handle) = session.with_path_cache(storage, |c| c.get(path)) {
            return Ok(handle);
        }

        debug!("Resolving {:?} by segment walk", path);
        let mut current = PathBuf::from("/");
        let mut handle = ObjectHandle::ROOT;
        for component in path.components() {
            let segment = match component {
                Component::Normal(part) => part,
                _ => continue,
            };
            let next = current.join(segment);
            if let Some(cached) = session.with_path_cache(storage, |c| c.get(&next)) {
                current = next;
                handle = cached;
                continue;
            }
            let entries = self.fetch_children(session, device_id, storage, &current, handle)?;
            let found = entries
                .iter()
                .find(|e| e.name.as_str() == segment)
                .map(|e| e.handle);
            match found {
                Some(h) => {
                    current = next;
                    handle = h;
                }
                None => {
                    return Err(DeviceError::NotFound {
                        device_id: device_id.to_string(),
                        path: next.to_string_lossy().to_string(),
                    })
                }
            }
        }
        Ok(handle)
    }

    /// Children of one directory, cache-aware. A device round trip fills
    /// both the listing cache and the path cache for every entry.
    pub(super) fn fetch_children(
        &self,
        session: &Arc<DeviceSession>,
        device_id: &str,
        storage: StorageId,
        dir_path: &Path,
        dir_handle: ObjectHandle,
    ) -> Result<Vec<ObjectInfo>, DeviceError> {
        if let Some(entries) = session.with_listing_cache(storage, |c| c.get(dir_path)) {
            debug!("Listing cache hit for {:?}", dir_path);
            return Ok(entries);
        }

        let mut entries =
            self.submit(session, device_id, &dir_path.to_string_lossy(), |reply| {
                Command::ListChildren {
                    storage,
                    parent: dir_handle,
                    reply,
                }
            })?;
        sort_entries(&mut entries);

        session.with_path_cache(storage, |cache| {
            for entry in &entries {
                cache.insert(dir_path.join(&entry.name), entry.handle);
            }
        });
        session.with_listing_cache(storage, |cache| {
            cache.insert(dir_path.to_path_buf(), entries.clone());
        });
        Ok(entries)
    }
}

/// Folders first, then files, each group sorted case-insensitively.
fn sort_entries(entries: &mut [ObjectInfo]) {
    entries.sort_by(|a, b| {
        let a_dir = a.is_folder();
        let b_dir = b.is_folder();
        b_dir
            .cmp(&a_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}
