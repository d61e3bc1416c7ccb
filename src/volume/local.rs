//! Local filesystem volume.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use super::{CopyScanResult, FileEntry, SpaceInfo, Volume, VolumeError};

/// A volume backed by the local filesystem, rooted at an arbitrary path.
///
/// `new` builds a plain local volume; `network_mount` marks the volume as
/// sitting on a network protocol (SMB, NFS, ...), which steers the
/// transfer engine toward chunked copies with per-chunk cancellation.
pub struct LocalVolume {
    name: String,
    root: PathBuf,
    network: bool,
}

impl LocalVolume {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            network: false,
        }
    }

    pub fn network_mount(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            network: true,
        }
    }

    /// Resolves a volume-relative path to an absolute one.
    ///
    /// Empty paths and "." mean the root. Absolute paths are treated as
    /// relative to the volume root unless they already live under it.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() || path == Path::new(".") {
            self.root.clone()
        } else if path.is_absolute() {
            if path.starts_with(&self.root) {
                path.to_path_buf()
            } else {
                let relative = path.strip_prefix("/").unwrap_or(path);
                self.root.join(relative)
            }
        } else {
            self.root.join(path)
        }
    }

    fn entry_for(&self, rel_path: &Path, abs_path: &Path) -> Result<FileEntry, VolumeError> {
        let metadata = std::fs::symlink_metadata(abs_path)?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        let is_directory = metadata.is_dir();
        let name = abs_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(FileEntry {
            name,
            path: rel_path.to_string_lossy().to_string(),
            is_directory,
            size: if is_directory {
                None
            } else {
                Some(metadata.len())
            },
            modified,
        })
    }
}

impl Volume for LocalVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn list(&self, path: &Path) -> Result<Vec<FileEntry>, VolumeError> {
        let abs = self.resolve(path);
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(&abs)? {
            let dirent = dirent?;
            let rel = path.join(dirent.file_name());
            entries.push(self.entry_for(&rel, &dirent.path())?);
        }
        // Directories first, then case-insensitive by name.
        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> Result<FileEntry, VolumeError> {
        let abs = self.resolve(path);
        self.entry_for(path, &abs)
    }

    fn exists(&self, path: &Path) -> bool {
        // symlink_metadata so broken symlinks still count as present.
        std::fs::symlink_metadata(self.resolve(path)).is_ok()
    }

    fn create_folder(&self, path: &Path) -> Result<(), VolumeError> {
        std::fs::create_dir(self.resolve(path))?;
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<(), VolumeError> {
        let abs = self.resolve(path);
        let metadata = std::fs::symlink_metadata(&abs)?;
        if metadata.is_dir() {
            std::fs::remove_dir_all(&abs)?;
        } else {
            std::fs::remove_file(&abs)?;
        }
        Ok(())
    }

    fn rename(&self, path: &Path, new_name: &str) -> Result<(), VolumeError> {
        let abs = self.resolve(path);
        let target = abs
            .parent()
            .map(|p| p.join(new_name))
            .ok_or_else(|| VolumeError::io("path has no parent"))?;
        if target.exists() {
            return Err(VolumeError::AlreadyExists {
                path: target.to_string_lossy().to_string(),
            });
        }
        std::fs::rename(&abs, &target)?;
        Ok(())
    }

    fn move_entry(&self, path: &Path, new_parent: &Path) -> Result<(), VolumeError> {
        let abs = self.resolve(path);
        let name = abs
            .file_name()
            .ok_or_else(|| VolumeError::io("path has no final component"))?;
        let target = self.resolve(new_parent).join(name);
        if target.exists() {
            return Err(VolumeError::AlreadyExists {
                path: target.to_string_lossy().to_string(),
            });
        }
        std::fs::rename(&abs, &target)?;
        Ok(())
    }

    fn scan_for_copy(&self, path: &Path) -> Result<CopyScanResult, VolumeError> {
        let abs = self.resolve(path);
        let mut result = CopyScanResult::default();
        for entry in WalkDir::new(&abs).min_depth(0) {
            let entry = entry.map_err(|e| VolumeError::io(e.to_string()))?;
            let ft = entry.file_type();
            if ft.is_file() {
                result.file_count += 1;
                if let Ok(meta) = entry.metadata() {
                    result.total_bytes += meta.len();
                }
            } else if ft.is_dir() && entry.depth() > 0 {
                result.dir_count += 1;
            }
        }
        Ok(result)
    }

    #[cfg(unix)]
    fn space_info(&self) -> Result<SpaceInfo, VolumeError> {
        space_info_for_path(&self.root)
    }

    fn local_path(&self) -> Option<PathBuf> {
        Some(self.root.clone())
    }

    fn is_network_mount(&self) -> bool {
        self.network
    }

    fn export_to_local(&self, source: &Path, local_dest: &Path) -> Result<u64, VolumeError> {
        copy_recursive(&self.resolve(source), local_dest)
    }

    fn import_from_local(&self, local_source: &Path, dest: &Path) -> Result<u64, VolumeError> {
        copy_recursive(local_source, &self.resolve(dest))
    }
}

/// Recursively copies a file or directory tree. Returns bytes copied.
pub(crate) fn copy_recursive(source: &Path, dest: &Path) -> Result<u64, VolumeError> {
    let meta = std::fs::metadata(source)?;
    let mut total_bytes = 0;

    if meta.is_file() {
        std::fs::copy(source, dest)?;
        total_bytes = meta.len();
    } else if meta.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            total_bytes += copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    }

    Ok(total_bytes)
}

/// statvfs-backed space query.
#[cfg(unix)]
pub(crate) fn space_info_for_path(path: &Path) -> Result<SpaceInfo, VolumeError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let path_c = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| VolumeError::io(e.to_string()))?;

    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(path_c.as_ptr(), &mut stat) == 0 {
            #[allow(clippy::unnecessary_cast)]
            let block_size = stat.f_frsize as u64;
            #[allow(clippy::unnecessary_cast)]
            let total_bytes = (stat.f_blocks as u64) * block_size;
            #[allow(clippy::unnecessary_cast)]
            let available_bytes = (stat.f_bavail as u64) * block_size;
            #[allow(clippy::unnecessary_cast)]
            let used_bytes = total_bytes.saturating_sub((stat.f_bfree as u64) * block_size);
            Ok(SpaceInfo {
                total_bytes,
                available_bytes,
                used_bytes,
            })
        } else {
            Err(VolumeError::io(format!(
                "statvfs failed for {}",
                path.display()
            )))
        }
    }
}
