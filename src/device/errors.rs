//! Error taxonomy for device sessions.

use serde::Serialize;

use super::protocol::ProtocolFailure;

/// Errors surfaced by [`DeviceSessionManager`](super::DeviceSessionManager).
///
/// Serialized with a `type` tag so callers can branch on the error kind
/// without string matching.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum DeviceError {
    /// No session is open for this device (never opened, or closed).
    NotConnected { device_id: String },
    /// The device disappeared. The failed operation is aborted; the session
    /// must be explicitly reopened before further use.
    Disconnected { device_id: String },
    /// Another process holds the device. `owner_hint` names it when the
    /// platform could tell.
    ExclusiveAccess {
        device_id: String,
        owner_hint: Option<String>,
    },
    /// The operation did not complete within the configured timeout.
    Timeout { device_id: String },
    /// No object exists at the given path.
    NotFound { device_id: String, path: String },
    /// The target storage rejects writes.
    ReadOnlyStorage { device_id: String },
    /// The storage has no room for the write.
    StorageFull { device_id: String },
    /// The device reported a transient busy condition.
    Busy { device_id: String },
    /// The device does not support the requested operation.
    NotSupported { device_id: String, operation: String },
    /// Protocol-level failure with device-reported detail.
    Protocol { device_id: String, detail: String },
    /// Anything else.
    Other { device_id: String, message: String },
}

impl DeviceError {
    /// Whether retrying the same operation may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeviceError::Timeout { .. } | DeviceError::Busy { .. })
    }

    /// User-facing message with remediation guidance where one exists.
    pub fn user_message(&self) -> String {
        match self {
            DeviceError::NotConnected { .. } => {
                "Device is not connected. Open a session first.".to_string()
            }
            DeviceError::Disconnected { .. } => {
                "Device was disconnected. Reconnect it and reopen the session.".to_string()
            }
            DeviceError::ExclusiveAccess {
                owner_hint: Some(owner),
                ..
            } => format!(
                "Another process ({}) has exclusive access to this device. Close it and try again.",
                owner
            ),
            DeviceError::ExclusiveAccess {
                owner_hint: None, ..
            } => "Another application has exclusive access to this device. Close apps that sync \
                  or import from it and try again."
                .to_string(),
            DeviceError::Timeout { .. } => {
                "The device did not respond in time. Check the cable and try again.".to_string()
            }
            DeviceError::NotFound { path, .. } => format!("\"{}\" was not found on the device.", path),
            DeviceError::ReadOnlyStorage { .. } => {
                "This storage is read-only. Files cannot be written to it.".to_string()
            }
            DeviceError::StorageFull { .. } => {
                "The device storage is full. Free up space and try again.".to_string()
            }
            DeviceError::Busy { .. } => {
                "The device is busy. Wait a moment and try again.".to_string()
            }
            DeviceError::NotSupported { operation, .. } => {
                format!("This device does not support {}.", operation)
            }
            DeviceError::Protocol { detail, .. } => {
                format!("The device reported an error: {}", detail)
            }
            DeviceError::Other { message, .. } => message.clone(),
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            DeviceError::NotConnected { device_id }
            | DeviceError::Disconnected { device_id }
            | DeviceError::ExclusiveAccess { device_id, .. }
            | DeviceError::Timeout { device_id }
            | DeviceError::NotFound { device_id, .. }
            | DeviceError::ReadOnlyStorage { device_id }
            | DeviceError::StorageFull { device_id }
            | DeviceError::Busy { device_id }
            | DeviceError::NotSupported { device_id, .. }
            | DeviceError::Protocol { device_id, .. }
            | DeviceError::Other { device_id, .. } => device_id,
        }
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NotConnected { device_id } => {
                write!(f, "device {} is not connected", device_id)
            }
            DeviceError::Disconnected { device_id } => {
                write!(f, "device {} disconnected", device_id)
            }
            DeviceError::ExclusiveAccess {
                device_id,
                owner_hint: Some(owner),
            } => write!(f, "device {} held by {}", device_id, owner),
            DeviceError::ExclusiveAccess {
                device_id,
                owner_hint: None,
            } => write!(f, "device {} held by another process", device_id),
            DeviceError::Timeout { device_id } => {
                write!(f, "operation on device {} timed out", device_id)
            }
            DeviceError::NotFound { device_id, path } => {
                write!(f, "{} not found on device {}", path, device_id)
            }
            DeviceError::ReadOnlyStorage { device_id } => {
                write!(f, "storage on device {} is read-only", device_id)
            }
            DeviceError::StorageFull { device_id } => {
                write!(f, "storage on device {} is full", device_id)
            }
            DeviceError::Busy { device_id } => write!(f, "device {} is busy", device_id),
            DeviceError::NotSupported {
                device_id,
                operation,
            } => write!(f, "device {} does not support {}", device_id, operation),
            DeviceError::Protocol { device_id, detail } => {
                write!(f, "protocol error on device {}: {}", device_id, detail)
            }
            DeviceError::Other { device_id, message } => {
                write!(f, "device {} error: {}", device_id, message)
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Maps a protocol-level failure into the public taxonomy, attaching the
/// device id and the path the operation was working on.
pub fn map_protocol_failure(failure: ProtocolFailure, device_id: &str, path: &str) -> DeviceError {
    let device_id = device_id.to_string();
    match failure {
        ProtocolFailure::Disconnected => DeviceError::Disconnected { device_id },
        ProtocolFailure::Timeout => DeviceError::Timeout { device_id },
        ProtocolFailure::ExclusiveAccess { owner_hint } => DeviceError::ExclusiveAccess {
            device_id,
            owner_hint,
        },
        ProtocolFailure::Busy => DeviceError::Busy { device_id },
        ProtocolFailure::NotFound => DeviceError::NotFound {
            device_id,
            path: path.to_string(),
        },
        ProtocolFailure::ReadOnly => DeviceError::ReadOnlyStorage { device_id },
        ProtocolFailure::AccessDenied => DeviceError::Protocol {
            device_id,
            detail: "access denied".to_string(),
        },
        ProtocolFailure::StorageFull => DeviceError::StorageFull { device_id },
        ProtocolFailure::Unsupported => DeviceError::NotSupported {
            device_id,
            operation: "this operation".to_string(),
        },
        ProtocolFailure::TransferAborted => DeviceError::Other {
            device_id,
            message: "transfer aborted before completion".to_string(),
        },
        ProtocolFailure::InvalidData(msg) => DeviceError::Protocol {
            device_id,
            detail: format!("invalid data: {}", msg),
        },
        ProtocolFailure::Protocol(detail) => DeviceError::Protocol { device_id, detail },
    }
}
