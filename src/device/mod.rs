//! Removable-device session management.
//!
//! [`DeviceSessionManager`] tracks devices announced by discovery, opens
//! protocol sessions on demand and routes every operation through one
//! message-passing worker per device. The worker owns the protocol client
//! outright, so one in-flight operation per device is a property of the
//! architecture rather than of lock discipline.
//!
//! The public API is synchronous. Calls block the caller thread against the
//! manager's private runtime; calling them from inside that runtime (i.e.
//! from a worker task) makes tokio panic immediately instead of deadlocking
//! the worker's own queue.

mod cache;
pub mod contention;
mod directory_ops;
pub mod errors;
#[cfg(test)]
pub(crate) mod fake;
mod file_ops;
#[cfg(any(target_os = "macos", target_os = "linux"))]
pub mod mtp;
mod mutation_ops;
pub mod protocol;
mod worker;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionConfig;
use cache::{ListingCache, PathHandleCache};
use contention::{ContentionDiagnostics, PlatformContention};
pub use errors::{map_protocol_failure, DeviceError};
pub use file_ops::{DownloadStream, UploadSink};
pub use protocol::{
    DeviceIdentity, DeviceOpener, ObjectHandle, ObjectInfo, ObjectKind, OpenedDevice,
    ProtocolClient, ProtocolFailure, StorageId, StorageInfo,
};
use worker::Command;

/// How long the exclusive-owner lookup may take before we give up on a
/// hint. Advisory only.
const CONTENTION_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of one tracked device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum ConnectionState {
    /// Known from discovery, no session.
    Disconnected,
    /// A session open is in progress.
    Connecting,
    /// Session open, worker running.
    Connected,
    /// Another process holds the device.
    Busy { owner_hint: Option<String> },
    /// The last session died (unplug or protocol failure). Reopen
    /// explicitly to recover.
    Error,
}

/// What a successfully opened session looks like to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub identity: DeviceIdentity,
    pub storages: Vec<StorageInfo>,
}

/// One open session: the worker's command queue plus per-storage caches.
///
/// Caches live and die with the session. A reopen builds a fresh
/// `DeviceSession`, which is what discards all cached handles and listings.
pub(crate) struct DeviceSession {
    commands: mpsc::Sender<Command>,
    storages: Vec<StorageInfo>,
    listing_ttl: Duration,
    path_cache: Mutex<HashMap<u32, PathHandleCache>>,
    listing_cache: Mutex<HashMap<u32, ListingCache>>,
}

impl DeviceSession {
    fn new(commands: mpsc::Sender<Command>, storages: Vec<StorageInfo>, listing_ttl: Duration) -> Self {
        Self {
            commands,
            storages,
            listing_ttl,
            path_cache: Mutex::new(HashMap::new()),
            listing_cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn storage(&self, storage: StorageId) -> Option<&StorageInfo> {
        self.storages.iter().find(|s| s.id == storage.0)
    }

    fn with_path_cache<R>(&self, storage: StorageId, f: impl FnOnce(&mut PathHandleCache) -> R) -> R {
        let mut caches = self.path_cache.lock().unwrap_or_else(|e| e.into_inner());
        f(caches.entry(storage.0).or_default())
    }

    fn with_listing_cache<R>(&self, storage: StorageId, f: impl FnOnce(&mut ListingCache) -> R) -> R {
        let mut caches = self.listing_cache.lock().unwrap_or_else(|e| e.into_inner());
        f(caches
            .entry(storage.0)
            .or_insert_with(|| ListingCache::new(self.listing_ttl)))
    }
}

struct DeviceRecord {
    identity: DeviceIdentity,
    state: ConnectionState,
    session: Option<Arc<DeviceSession>>,
}

/// Manages sessions for all tracked removable devices.
pub struct DeviceSessionManager {
    runtime: tokio::runtime::Runtime,
    config: SessionConfig,
    contention: Box<dyn ContentionDiagnostics>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceSessionManager {
    /// Builds a manager with its own private runtime for device workers.
    pub fn new(config: SessionConfig) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("portage-device")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            config,
            contention: Box::new(PlatformContention),
            devices: RwLock::new(HashMap::new()),
        })
    }

    /// Replaces the exclusive-access diagnostics (tests, or platforms where
    /// the default lookup is known to be useless).
    pub fn with_contention_diagnostics(mut self, diag: Box<dyn ContentionDiagnostics>) -> Self {
        self.contention = diag;
        self
    }

    /// Feed from discovery: a device was plugged in (or enumerated at
    /// startup). Idempotent; an already-tracked device keeps its state.
    pub fn device_appeared(&self, identity: DeviceIdentity) {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        let id = identity.id.clone();
        devices.entry(id.clone()).or_insert_with(|| {
            debug!("Tracking device {} ({})", id, identity.display_name());
            DeviceRecord {
                identity,
                state: ConnectionState::Disconnected,
                session: None,
            }
        });
    }

    /// Feed from discovery: a device was unplugged. Tears down any open
    /// session and forgets the device.
    pub fn device_removed(&self, device_id: &str) {
        let removed = {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            devices.remove(device_id)
        };
        if let Some(record) = removed {
            info!("Device {} removed", device_id);
            if let Some(session) = record.session {
                let _ = session.commands.try_send(Command::Close);
            }
        }
    }

    /// Identities of all tracked devices with their current states.
    pub fn devices(&self) -> Vec<(DeviceIdentity, ConnectionState)> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices
            .values()
            .map(|r| (r.identity.clone(), r.state.clone()))
            .collect()
    }

    pub fn device_state(&self, device_id: &str) -> Option<ConnectionState> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices.get(device_id).map(|r| r.state.clone())
    }

    /// Opens a session for a tracked device. Idempotent: if a session is
    /// already open, returns its info without touching the device.
    ///
    /// Fails with `Disconnected` for unknown devices, `ExclusiveAccess`
    /// (with an owner hint when the platform can name one) when another
    /// process holds the device, `Busy` when another caller is already
    /// opening this device, and `Timeout` when the open stalls.
    pub fn open_session(
        &self,
        device_id: &str,
        opener: &dyn DeviceOpener,
    ) -> Result<SessionInfo, DeviceError> {
        {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            match devices.get_mut(device_id) {
                None => {
                    return Err(DeviceError::Disconnected {
                        device_id: device_id.to_string(),
                    })
                }
                Some(record) => {
                    if let Some(session) = &record.session {
                        debug!("Session already open for {}", device_id);
                        return Ok(SessionInfo {
                            identity: record.identity.clone(),
                            storages: session.storages.clone(),
                        });
                    }
                    if record.state == ConnectionState::Connecting {
                        debug!("Open already in progress for {}", device_id);
                        return Err(DeviceError::Busy {
                            device_id: device_id.to_string(),
                        });
                    }
                    // Claimed under the same lock as the session check, so
                    // a concurrent open sees Connecting and cannot start a
                    // second protocol session on the same hardware.
                    record.state = ConnectionState::Connecting;
                }
            }
        }

        info!("Opening session for {}", device_id);
        let started = std::time::Instant::now();

        let outcome = self.runtime.block_on(async {
            tokio::time::timeout(self.config.op_timeout, opener.open(device_id)).await
        });
        let opened = match outcome {
            Err(_) => {
                warn!(
                    "Open timed out for {} after {:?}",
                    device_id, self.config.op_timeout
                );
                self.set_state(device_id, ConnectionState::Error);
                return Err(DeviceError::Timeout {
                    device_id: device_id.to_string(),
                });
            }
            Ok(Err(ProtocolFailure::ExclusiveAccess { owner_hint })) => {
                let hint = owner_hint
                    .or_else(|| self.contention.blocking_process(CONTENTION_LOOKUP_TIMEOUT));
                warn!(
                    "Device {} held by another process (owner: {:?})",
                    device_id, hint
                );
                self.set_state(
                    device_id,
                    ConnectionState::Busy {
                        owner_hint: hint.clone(),
                    },
                );
                return Err(DeviceError::ExclusiveAccess {
                    device_id: device_id.to_string(),
                    owner_hint: hint,
                });
            }
            Ok(Err(failure)) => {
                warn!("Open failed for {}: {}", device_id, failure);
                self.set_state(device_id, ConnectionState::Error);
                return Err(map_protocol_failure(failure, device_id, "/"));
            }
            Ok(Ok(opened)) => opened,
        };

        let (commands, command_rx) = mpsc::channel(self.config.command_queue_depth);
        self.runtime
            .spawn(worker::run(device_id.to_string(), opened.client, command_rx));

        // First command: enumerate storages so callers get them with the
        // session info and read-only flags are known before any upload.
        let (reply_tx, reply_rx) = oneshot::channel();
        let storages = commands
            .blocking_send(Command::Storages { reply: reply_tx })
            .map_err(|_| DeviceError::Disconnected {
                device_id: device_id.to_string(),
            })
            .and_then(|_| self.await_reply(reply_rx, device_id, "/"));
        let storages = match storages {
            Ok(storages) => storages,
            Err(e) => {
                let _ = commands.try_send(Command::Close);
                self.set_state(device_id, ConnectionState::Error);
                return Err(e);
            }
        };

        let mut identity = opened.identity;
        identity.id = device_id.to_string();
        let session = Arc::new(DeviceSession::new(
            commands,
            storages.clone(),
            self.config.listing_ttl,
        ));

        {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = devices.get_mut(device_id) {
                record.identity = identity.clone();
                record.state = ConnectionState::Connected;
                record.session = Some(session);
            } else {
                // Device vanished from tracking while we were opening.
                return Err(DeviceError::Disconnected {
                    device_id: device_id.to_string(),
                });
            }
        }

        info!(
            "Session open for {} ({} storage(s), {:?})",
            device_id,
            storages.len(),
            started.elapsed()
        );
        Ok(SessionInfo { identity, storages })
    }

    /// Closes a session. Never fails; closing an absent session is a no-op.
    pub fn close_session(&self, device_id: &str) {
        let session = {
            let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
            match devices.get_mut(device_id) {
                Some(record) => {
                    record.state = ConnectionState::Disconnected;
                    record.session.take()
                }
                None => None,
            }
        };
        if let Some(session) = session {
            info!("Closing session for {}", device_id);
            let _ = session.commands.try_send(Command::Close);
        }
    }

    /// Explicit reconnection: tears the old session down and opens a fresh
    /// one. All caches for the device are discarded with the old session.
    pub fn reopen_session(
        &self,
        device_id: &str,
        opener: &dyn DeviceOpener,
    ) -> Result<SessionInfo, DeviceError> {
        self.close_session(device_id);
        self.open_session(device_id, opener)
    }

    /// Info for an open session.
    pub fn session_info(&self, device_id: &str) -> Result<SessionInfo, DeviceError> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let record = devices
            .get(device_id)
            .ok_or_else(|| DeviceError::NotConnected {
                device_id: device_id.to_string(),
            })?;
        let session = record
            .session
            .as_ref()
            .ok_or_else(|| DeviceError::NotConnected {
                device_id: device_id.to_string(),
            })?;
        Ok(SessionInfo {
            identity: record.identity.clone(),
            storages: session.storages.clone(),
        })
    }

    fn set_state(&self, device_id: &str, state: ConnectionState) {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = devices.get_mut(device_id) {
            record.state = state;
        }
    }

    pub(crate) fn session(&self, device_id: &str) -> Result<Arc<DeviceSession>, DeviceError> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices
            .get(device_id)
            .and_then(|r| r.session.clone())
            .ok_or_else(|| DeviceError::NotConnected {
                device_id: device_id.to_string(),
            })
    }

    /// Sends one command to the device worker and blocks for the reply.
    ///
    /// Runs on the caller's thread against the manager's private runtime;
    /// tokio refuses `block_on` from inside a runtime worker, so calling
    /// this from a device worker panics instead of deadlocking the queue.
    /// A timeout abandons the reply but the command may still complete on
    /// the device.
    pub(crate) fn submit<T>(
        &self,
        session: &DeviceSession,
        device_id: &str,
        path: &str,
        make: impl FnOnce(oneshot::Sender<Result<T, ProtocolFailure>>) -> Command,
    ) -> Result<T, DeviceError>
    where
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        session
            .commands
            .blocking_send(make(reply_tx))
            .map_err(|_| self.note_disconnect(device_id))?;
        self.await_reply(reply_rx, device_id, path)
    }

    fn await_reply<T>(
        &self,
        reply: oneshot::Receiver<Result<T, ProtocolFailure>>,
        device_id: &str,
        path: &str,
    ) -> Result<T, DeviceError> {
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(self.config.op_timeout, reply).await });
        match outcome {
            Err(_) => Err(DeviceError::Timeout {
                device_id: device_id.to_string(),
            }),
            Ok(Err(_)) => Err(self.note_disconnect(device_id)),
            Ok(Ok(Err(ProtocolFailure::Disconnected))) => Err(self.note_disconnect(device_id)),
            Ok(Ok(Err(failure))) => Err(map_protocol_failure(failure, device_id, path)),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    /// Records that the device dropped mid-operation. The session stays in
    /// place (further calls fail fast at the protocol) until the caller
    /// explicitly reopens.
    fn note_disconnect(&self, device_id: &str) -> DeviceError {
        warn!("Device {} disconnected mid-operation", device_id);
        self.set_state(device_id, ConnectionState::Error);
        DeviceError::Disconnected {
            device_id: device_id.to_string(),
        }
    }

    pub(crate) fn stream_lookahead(&self) -> usize {
        self.config.stream_lookahead
    }
}

/// Normalizes a device path to an absolute, `/`-separated form.
///
/// Empty paths and "." mean the storage root. Relative paths are taken as
/// relative to the root. `..` components are rejected by resolution later
/// (they never match an object name).
pub(crate) fn normalize_device_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {}
        }
    }
    normalized
}
