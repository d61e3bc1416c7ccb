//! Best-effort detection of processes holding exclusive device access.
//!
//! On macOS the system's camera daemon (`ptpcamerad`) grabs PTP/MTP devices
//! the moment they are plugged in, and the USB registry records who holds
//! the interface. When opening a session fails with an exclusive-access
//! error, this lookup can often name the culprit for the error message.
//!
//! The lookup is advisory only: it runs with its own short timeout and a
//! `None` result never blocks or changes the primary error path.

use std::time::Duration;

#[cfg(target_os = "macos")]
use log::debug;

/// Names the process holding a device, when the platform can tell.
pub trait ContentionDiagnostics: Send + Sync {
    /// Returns something like "pid 45145, ptpcamerad", or `None` when no
    /// owner could be determined within `timeout`.
    fn blocking_process(&self, timeout: Duration) -> Option<String>;
}

/// Platform-backed diagnostics. Only macOS exposes the owner today; other
/// platforms always answer `None`.
pub struct PlatformContention;

impl ContentionDiagnostics for PlatformContention {
    #[cfg(target_os = "macos")]
    fn blocking_process(&self, timeout: Duration) -> Option<String> {
        // ioreg can take a while on big USB trees; run it on a throwaway
        // thread so the timeout is enforceable.
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(query_usb_exclusive_owner());
        });
        match rx.recv_timeout(timeout) {
            Ok(owner) => owner,
            Err(_) => {
                debug!("Exclusive-owner lookup timed out after {:?}", timeout);
                None
            }
        }
    }

    #[cfg(not(target_os = "macos"))]
    fn blocking_process(&self, _timeout: Duration) -> Option<String> {
        None
    }
}

/// Diagnostics that never name an owner. Used in tests and on platforms
/// where the lookup is known to be useless.
pub struct NoContentionDiagnostics;

impl ContentionDiagnostics for NoContentionDiagnostics {
    fn blocking_process(&self, _timeout: Duration) -> Option<String> {
        None
    }
}

/// Queries the IORegistry for a `UsbExclusiveOwner` property.
#[cfg(target_os = "macos")]
fn query_usb_exclusive_owner() -> Option<String> {
    use std::process::Command;

    let output = Command::new("ioreg").args(["-l", "-w", "0"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_exclusive_owner(&text)
}

/// Extracts the owner string from ioreg output. Lines look like:
/// `    "UsbExclusiveOwner" = "pid 45145, ptpcamerad"`
#[cfg(any(target_os = "macos", test))]
fn parse_exclusive_owner(ioreg_output: &str) -> Option<String> {
    for line in ioreg_output.lines() {
        if let Some(idx) = line.find("\"UsbExclusiveOwner\"") {
            let rest = &line[idx + "\"UsbExclusiveOwner\"".len()..];
            let value = rest.split('=').nth(1)?.trim();
            let owner = value.trim_matches('"').trim();
            if !owner.is_empty() {
                return Some(owner.to_string());
            }
        }
    }
    None
}
