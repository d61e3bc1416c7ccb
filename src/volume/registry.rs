//! Volume registry.
//!
//! Maps stable volume ids to live [`Volume`] instances so the transfer
//! engine and browsing callers share one view of what is mounted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, info};

use super::device::DeviceVolume;
use super::{Volume, VolumeError};
use crate::device::{DeviceSessionManager, StorageId};

#[derive(Default)]
pub struct VolumeRegistry {
    volumes: RwLock<HashMap<String, Arc<dyn Volume>>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, volume: Arc<dyn Volume>) {
        let id = id.into();
        info!("Registering volume {} ({})", id, volume.name());
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        volumes.insert(id, volume);
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        let removed = volumes.remove(id).is_some();
        if removed {
            debug!("Unregistered volume {}", id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Volume>> {
        let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
        volumes.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let volumes = self.volumes.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = volumes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registers one volume per storage of an open device session, under
    /// ids of the form `{device_id}:{storage_id}`. Returns the ids added.
    pub fn register_device_storages(
        &self,
        manager: &Arc<DeviceSessionManager>,
        device_id: &str,
    ) -> Result<Vec<String>, VolumeError> {
        let session = manager
            .session_info(device_id)
            .map_err(super::device::map_device_error)?;
        let device_name = session.identity.display_name();

        let mut ids = Vec::with_capacity(session.storages.len());
        for storage in &session.storages {
            let id = format!("{}:{}", device_id, storage.id);
            let name = if session.storages.len() == 1 {
                device_name.clone()
            } else {
                format!("{} ({})", device_name, storage.name)
            };
            let volume = DeviceVolume::new(
                Arc::clone(manager),
                device_id,
                StorageId(storage.id),
                name,
            );
            self.register(id.clone(), Arc::new(volume));
            ids.push(id);
        }
        Ok(ids)
    }

    /// Drops every volume backed by the given device. Called when the
    /// device disappears or its session closes.
    pub fn unregister_device(&self, device_id: &str) -> Vec<String> {
        let prefix = format!("{}:", device_id);
        let mut volumes = self.volumes.write().unwrap_or_else(|e| e.into_inner());
        let removed: Vec<String> = volumes
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        for id in &removed {
            volumes.remove(id);
            debug!("Unregistered volume {}", id);
        }
        removed
    }
}
