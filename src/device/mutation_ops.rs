//! Mutating operations: create, delete, rename, move.
//!
//! Every mutation updates the caches as part of the same call, so a
//! successful mutation is never followed by a stale cached answer: the
//! affected path subtree is dropped from the handle cache and every parent
//! listing that changed is invalidated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use super::worker::Command;
use super::{
    normalize_device_path, DeviceError, DeviceSession, DeviceSessionManager, ObjectInfo,
    ObjectKind, StorageId,
};

impl DeviceSessionManager {
    /// Creates a folder at `path`. Parent folders must already exist.
    pub fn create_folder(
        &self,
        device_id: &str,
        storage: StorageId,
        path: &Path,
    ) -> Result<ObjectInfo, DeviceError> {
        let path = normalize_device_path(path);
        let (parent, name) = split_path(&path, device_id)?;
        let session = self.session(device_id)?;
        let parent_handle = self.resolve_in_session(&session, device_id, storage, &parent)?;

        let handle = self.submit(&session, device_id, &path.to_string_lossy(), |reply| {
            Command::CreateFolder {
                storage,
                parent: parent_handle,
                name: name.clone(),
                reply,
            }
        })?;

        session.with_path_cache(storage, |c| c.insert(path.clone(), handle));
        session.with_listing_cache(storage, |c| c.invalidate(&parent));
        info!("Created folder {:?} on {}", path, device_id);
        Ok(ObjectInfo {
            handle,
            name,
            kind: ObjectKind::Folder,
            size: 0,
            modified_at: None,
        })
    }

    /// Deletes a file or folder. Folders are deleted recursively, children
    /// first, because the protocol only removes empty folders.
    pub fn delete(
        &self,
        device_id: &str,
        storage: StorageId,
        path: &Path,
    ) -> Result<(), DeviceError> {
        let path = normalize_device_path(path);
        if path == Path::new("/") {
            return Err(DeviceError::Other {
                device_id: device_id.to_string(),
                message: "cannot delete the storage root".to_string(),
            });
        }
        let session = self.session(device_id)?;
        let info = self.stat(device_id, storage, &path)?;
        self.delete_tree(&session, device_id, storage, &path, &info)?;

        let parent = parent_of(&path);
        session.with_path_cache(storage, |c| c.remove_subtree(&path));
        session.with_listing_cache(storage, |c| {
            c.invalidate_subtree(&path);
            c.invalidate(&parent);
        });
        info!("Deleted {:?} on {}", path, device_id);
        Ok(())
    }

    fn delete_tree(
        &self,
        session: &Arc<DeviceSession>,
        device_id: &str,
        storage: StorageId,
        path: &Path,
        info: &ObjectInfo,
    ) -> Result<(), DeviceError> {
        if info.is_folder() {
            let children =
                self.fetch_children(session, device_id, storage, path, info.handle)?;
            debug!("Deleting {} children of {:?}", children.len(), path);
            for child in &children {
                self.delete_tree(session, device_id, storage, &path.join(&child.name), child)?;
            }
        }
        let handle = info.handle;
        self.submit(session, device_id, &path.to_string_lossy(), |reply| {
            Command::Delete {
                storage,
                handle,
                reply,
            }
        })
    }

    /// Renames an object in place.
    pub fn rename(
        &self,
        device_id: &str,
        storage: StorageId,
        path: &Path,
        new_name: &str,
    ) -> Result<ObjectInfo, DeviceError> {
        let path = normalize_device_path(path);
        if path == Path::new("/") {
            return Err(DeviceError::Other {
                device_id: device_id.to_string(),
                message: "cannot rename the storage root".to_string(),
            });
        }
        let session = self.session(device_id)?;
        let info = self.stat(device_id, storage, &path)?;
        let handle = info.handle;
        let owned_name = new_name.to_string();
        self.submit(&session, device_id, &path.to_string_lossy(), |reply| {
            Command::Rename {
                storage,
                handle,
                new_name: owned_name,
                reply,
            }
        })?;

        let parent = parent_of(&path);
        let new_path = parent.join(new_name);
        session.with_path_cache(storage, |c| {
            c.remove_subtree(&path);
            c.insert(new_path.clone(), handle);
        });
        session.with_listing_cache(storage, |c| {
            c.invalidate_subtree(&path);
            c.invalidate(&parent);
        });
        info!("Renamed {:?} to {} on {}", path, new_name, device_id);
        Ok(ObjectInfo {
            name: new_name.to_string(),
            ..info
        })
    }

    /// Moves an object under a different parent folder on the same storage.
    /// The object keeps its protocol handle.
    pub fn move_object(
        &self,
        device_id: &str,
        storage: StorageId,
        path: &Path,
        new_parent: &Path,
    ) -> Result<(), DeviceError> {
        let path = normalize_device_path(path);
        let new_parent = normalize_device_path(new_parent);
        let (_, name) = split_path(&path, device_id)?;
        let session = self.session(device_id)?;
        let handle = self.resolve_in_session(&session, device_id, storage, &path)?;
        let parent_handle = self.resolve_in_session(&session, device_id, storage, &new_parent)?;

        self.submit(&session, device_id, &path.to_string_lossy(), |reply| {
            Command::MoveObject {
                storage,
                handle,
                new_parent: parent_handle,
                reply,
            }
        })?;

        let old_parent = parent_of(&path);
        let new_path = new_parent.join(&name);
        session.with_path_cache(storage, |c| {
            c.remove_subtree(&path);
            c.insert(new_path.clone(), handle);
        });
        session.with_listing_cache(storage, |c| {
            c.invalidate_subtree(&path);
            c.invalidate(&old_parent);
            c.invalidate(&new_parent);
        });
        info!(
            "Moved {:?} to {:?} on {}",
            path, new_path, device_id
        );
        Ok(())
    }
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"))
}

fn split_path(path: &Path, device_id: &str) -> Result<(PathBuf, String), DeviceError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| DeviceError::Other {
            device_id: device_id.to_string(),
            message: format!("path {:?} has no final component", path),
        })?;
    Ok((parent_of(path), name))
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
    fn test_create_folder_then_resolve_then_list_empty() {
        let (manager, _tree, storage) = setup();
        manager.list("device-1", storage, Path::new("/")).unwrap();

        let created = manager
            .create_folder("device-1", storage, Path::new("/Imports"))
            .unwrap();
        assert!(created.is_folder());

        // Resolvable immediately, and lists as empty.
        let handle = manager
            .resolve_path("device-1", storage, Path::new("/Imports"))
            .unwrap();
        assert_eq!(handle, created.handle);
        let entries = manager.list("device-1", storage, Path::new("/Imports")).unwrap();
        assert!(entries.is_empty());

        // The parent listing reflects the new folder despite having been
        // cached before the mutation.
        let root = manager.list("device-1", storage, Path::new("/")).unwrap();
        assert!(root.iter().any(|e| e.name == "Imports"));
    }

    #[test]
    fn test_delete_file_updates_caches() {
        let (manager, tree, storage) = setup();
        tree.add_file("/Music/song.mp3", vec![1, 2, 3]);
        manager.list("device-1", storage, Path::new("/Music")).unwrap();

        manager
            .delete("device-1", storage, Path::new("/Music/song.mp3"))
            .unwrap();

        assert!(tree.lookup("/Music/song.mp3").is_none());
        let entries = manager.list("device-1", storage, Path::new("/Music")).unwrap();
        assert!(entries.is_empty());
        assert!(matches!(
            manager.stat("device-1", storage, Path::new("/Music/song.mp3")),
            Err(DeviceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_folder_recurses() {
        let (manager, tree, storage) = setup();
        tree.add_file("/DCIM/Camera/a.jpg", vec![1]);
        tree.add_file("/DCIM/Camera/b.jpg", vec![2]);
        tree.add_file("/DCIM/screenshot.png", vec![3]);

        manager.delete("device-1", storage, Path::new("/DCIM")).unwrap();

        assert!(tree.lookup("/DCIM").is_none());
        assert!(tree.lookup("/DCIM/Camera/a.jpg").is_none());
    }

    #[test]
    fn test_delete_root_is_rejected() {
        let (manager, _tree, storage) = setup();
        assert!(manager.delete("device-1", storage, Path::new("/")).is_err());
    }

    #[test]
    fn test_rename_updates_both_paths() {
        let (manager, tree, storage) = setup();
        tree.add_file("/notes.txt", vec![1, 2, 3]);
        manager.list("device-1", storage, Path::new("/")).unwrap();

        let renamed = manager
            .rename("device-1", storage, Path::new("/notes.txt"), "renamed.txt")
            .unwrap();
        assert_eq!(renamed.name, "renamed.txt");

        assert!(matches!(
            manager.stat("device-1", storage, Path::new("/notes.txt")),
            Err(DeviceError::NotFound { .. })
        ));
        let info = manager
            .stat("device-1", storage, Path::new("/renamed.txt"))
            .unwrap();
        assert_eq!(info.handle, renamed.handle);
    }

    #[test]
    fn test_move_keeps_identity_and_invalidates_source() {
        let (manager, tree, storage) = setup();
        tree.add_file("/Downloads/report.pdf", vec![0u8; 128]);
        tree.add_folder("/Documents");
        manager.list("device-1", storage, Path::new("/Downloads")).unwrap();
        manager.list("device-1", storage, Path::new("/Documents")).unwrap();

        let before = manager
            .resolve_path("device-1", storage, Path::new("/Downloads/report.pdf"))
            .unwrap();
        manager
            .move_object(
                "device-1",
                storage,
                Path::new("/Downloads/report.pdf"),
                Path::new("/Documents"),
            )
            .unwrap();

        // Old path gone, new path resolves to the same object.
        assert!(matches!(
            manager.stat("device-1", storage, Path::new("/Downloads/report.pdf")),
            Err(DeviceError::NotFound { .. })
        ));
        let after = manager
            .resolve_path("device-1", storage, Path::new("/Documents/report.pdf"))
            .unwrap();
        assert_eq!(before, after);

        // Both cached parent listings reflect the move.
        let downloads = manager.list("device-1", storage, Path::new("/Downloads")).unwrap();
        assert!(downloads.is_empty());
        let documents = manager.list("device-1", storage, Path::new("/Documents")).unwrap();
        assert!(documents.iter().any(|e| e.name == "report.pdf"));
    }

    #[test]
    fn test_move_to_missing_parent_fails() {
        let (manager, tree, storage) = setup();
        tree.add_file("/a.txt", vec![1]);
        let err = manager
            .move_object("device-1", storage, Path::new("/a.txt"), Path::new("/nope"))
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFound { .. }));
    }
}
