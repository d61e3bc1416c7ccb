//! Chunked local copy and network-mount detection.
//!
//! Used when either endpoint of a local-to-local copy sits on a network
//! protocol mount: fixed-size chunks keep cancellation latency and
//! unacknowledged write buffering bounded. Remote writes are acknowledged
//! synchronously by the server, so completion schedules a best-effort
//! durability hint instead of a blocking flush.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::{TransferError, TransferShared};

/// Predicate for "is this path on a network-protocol mount". Supplied by
/// the platform by default; tests substitute their own.
pub trait MountInspector: Send + Sync {
    fn is_network_mount(&self, path: &Path) -> bool;
}

/// Inspects the real mount table.
pub struct PlatformMounts;

impl MountInspector for PlatformMounts {
    #[cfg(target_os = "macos")]
    fn is_network_mount(&self, path: &Path) -> bool {
        match mount_fstype(path) {
            Some(fstype) => is_network_filesystem(&fstype),
            None => false,
        }
    }

    #[cfg(target_os = "linux")]
    fn is_network_mount(&self, path: &Path) -> bool {
        match proc_mounts_fstype(path) {
            Some(fstype) => is_network_filesystem(&fstype),
            None => false,
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    fn is_network_mount(&self, _path: &Path) -> bool {
        false
    }
}

/// Fixed mount inspector for tests.
pub struct StaticMounts(pub bool);

impl MountInspector for StaticMounts {
    fn is_network_mount(&self, _path: &Path) -> bool {
        self.0
    }
}

pub(crate) fn is_network_filesystem(fstype: &str) -> bool {
    matches!(
        fstype,
        "smbfs" | "afpfs" | "webdav" | "nfs" | "nfs4" | "cifs" | "smb3"
    )
}

#[cfg(target_os = "macos")]
fn mount_fstype(path: &Path) -> Option<String> {
    use std::ffi::{CStr, CString};
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(c_path.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    let fstype = unsafe { CStr::from_ptr(stat.f_fstypename.as_ptr()) };
    Some(fstype.to_string_lossy().to_string())
}

#[cfg(target_os = "linux")]
fn proc_mounts_fstype(path: &Path) -> Option<String> {
    let mounts = std::fs::read_to_string("/proc/mounts").ok()?;
    fstype_from_mount_table(&mounts, path)
}

/// Finds the filesystem type of the longest mount point that prefixes
/// `path`. Mount table format: `device mountpoint fstype options ...`,
/// with spaces in paths encoded as `\040`.
#[cfg(any(target_os = "linux", test))]
fn fstype_from_mount_table(table: &str, path: &Path) -> Option<String> {
    let mut best: Option<(PathBuf, String)> = None;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let mount_point = PathBuf::from(fields.next()?.replace("\\040", " "));
        let fstype = fields.next()?;
        if path.starts_with(&mount_point) {
            let longer = match &best {
                Some((current, _)) => mount_point.as_os_str().len() > current.as_os_str().len(),
                None => true,
            };
            if longer {
                best = Some((mount_point, fstype.to_string()));
            }
        }
    }
    best.map(|(_, fstype)| fstype)
}

/// Copies one file in fixed chunks, checking the cancel flag and updating
/// progress after every chunk. A cancelled copy removes the partial
/// destination before returning.
pub(crate) fn chunked_copy(
    src: &Path,
    dst: &Path,
    chunk_size: usize,
    shared: &TransferShared,
) -> Result<u64, TransferError> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let mut buf = vec![0u8; chunk_size];
    let mut copied = 0u64;

    loop {
        if shared.is_cancelled() {
            drop(writer);
            let _ = std::fs::remove_file(dst);
            return Err(TransferError::Cancelled { files_processed: 0 });
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
        shared.add_bytes(n as u64);
    }
    writer.flush()?;
    drop(writer);

    preserve_metadata(src, dst);
    schedule_durability_hint(dst.to_path_buf());
    Ok(copied)
}

/// Whole-file local copy with metadata preservation. No per-chunk
/// progress; the caller reports completion.
pub(crate) fn plain_copy(src: &Path, dst: &Path) -> Result<u64, TransferError> {
    let copied = std::fs::copy(src, dst)?;
    preserve_metadata(src, dst);
    Ok(copied)
}

/// Best-effort carry-over of timestamps, permissions, extended attributes
/// and ACL entries. Failures are logged, never fatal: the bytes are what
/// the transfer promises.
pub(crate) fn preserve_metadata(src: &Path, dst: &Path) {
    if let Err(e) = copy_timestamps(src, dst) {
        warn!("Could not copy timestamps to {:?}: {}", dst, e);
    }
    if let Err(e) = copy_permissions(src, dst) {
        warn!("Could not copy permissions to {:?}: {}", dst, e);
    }
    #[cfg(unix)]
    if let Err(e) = copy_xattrs(src, dst) {
        warn!("Could not copy extended attributes to {:?}: {}", dst, e);
    }
    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    if let Err(e) = copy_acls(src, dst) {
        debug!("Could not copy ACL entries to {:?}: {}", dst, e);
    }
}

fn copy_timestamps(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = std::fs::metadata(src)?;
    let mtime = filetime::FileTime::from_last_modification_time(&meta);
    let atime = filetime::FileTime::from_last_access_time(&meta);
    filetime::set_file_times(dst, atime, mtime)
}

fn copy_permissions(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = std::fs::metadata(src)?;
    std::fs::set_permissions(dst, meta.permissions())
}

#[cfg(unix)]
fn copy_xattrs(src: &Path, dst: &Path) -> std::io::Result<()> {
    for attr in xattr::list(src)? {
        if let Some(value) = xattr::get(src, &attr)? {
            xattr::set(dst, &attr, &value)?;
        }
    }
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
fn copy_acls(src: &Path, dst: &Path) -> std::io::Result<()> {
    let entries = exacl::getfacl(src, None)?;
    exacl::setfacl(&[dst], &entries, None)?;
    Ok(())
}

/// Asks the OS to push the file toward stable storage without blocking
/// the transfer. Fire and forget.
fn schedule_durability_hint(path: PathBuf) {
    std::thread::spawn(move || {
        if let Ok(file) = File::open(&path) {
            if let Err(e) = file.sync_all() {
                debug!("Durability hint for {:?} failed: {}", path, e);
            }
        }
    });
}
