//! In-memory volume.
//!
//! A complete [`Volume`] over a map of paths, used by the transfer engine
//! tests to stand in for backends with arbitrary capability mixes:
//! streaming on or off, any domain label, adjustable chunk size and
//! capacity.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{CopyScanResult, FileEntry, SpaceInfo, Volume, VolumeError, VolumeReadStream};

#[derive(Debug, Clone)]
struct Node {
    is_dir: bool,
    data: Vec<u8>,
    modified: Option<i64>,
}

pub struct InMemoryVolume {
    name: String,
    root: PathBuf,
    state: Arc<Mutex<HashMap<PathBuf, Node>>>,
    capacity: Option<u64>,
    streaming_domain: Option<String>,
    chunk_size: usize,
}

impl InMemoryVolume {
    pub fn new(name: impl Into<String>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            PathBuf::from("/"),
            Node {
                is_dir: true,
                data: Vec::new(),
                modified: None,
            },
        );
        Self {
            name: name.into(),
            root: PathBuf::from("/"),
            state: Arc::new(Mutex::new(nodes)),
            capacity: None,
            streaming_domain: None,
            chunk_size: 64 * 1024,
        }
    }

    /// Enables streaming under the given serialization domain.
    pub fn with_streaming_domain(mut self, domain: impl Into<String>) -> Self {
        self.streaming_domain = Some(domain.into());
        self
    }

    /// Caps the volume at `bytes`; `space_info` reports against it.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Seeds a file, creating intermediate directories.
    pub fn write_file(&self, path: impl AsRef<Path>, data: Vec<u8>) {
        let path = normalize(path.as_ref());
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        ensure_parents(&mut state, &path);
        state.insert(
            path,
            Node {
                is_dir: false,
                data,
                modified: None,
            },
        );
    }

    pub fn read_file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let path = normalize(path.as_ref());
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .get(&path)
            .filter(|n| !n.is_dir)
            .map(|n| n.data.clone())
    }

    fn used_bytes(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.values().map(|n| n.data.len() as u64).sum()
    }

    fn entry_for(path: &Path, node: &Node) -> FileEntry {
        FileEntry {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "/".to_string()),
            path: path.to_string_lossy().to_string(),
            is_directory: node.is_dir,
            size: if node.is_dir {
                None
            } else {
                Some(node.data.len() as u64)
            },
            modified: node.modified,
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

fn ensure_parents(state: &mut HashMap<PathBuf, Node>, path: &Path) {
    let mut ancestor = PathBuf::from("/");
    if let Some(parent) = path.parent() {
        for component in parent.components() {
            if let Component::Normal(part) = component {
                ancestor.push(part);
                state.entry(ancestor.clone()).or_insert(Node {
                    is_dir: true,
                    data: Vec::new(),
                    modified: None,
                });
            }
        }
    }
}

impl Volume for InMemoryVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn list(&self, path: &Path) -> Result<Vec<FileEntry>, VolumeError> {
        let path = normalize(path);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.get(&path) {
            Some(n) if n.is_dir => {}
            Some(_) => {
                return Err(VolumeError::Io {
                    message: format!("not a directory: {}", path.display()),
                })
            }
            None => {
                return Err(VolumeError::NotFound {
                    path: path.to_string_lossy().to_string(),
                })
            }
        }
        let mut entries: Vec<FileEntry> = state
            .iter()
            .filter(|(p, _)| p.parent() == Some(&path))
            .map(|(p, n)| Self::entry_for(p, n))
            .collect();
        entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });
        Ok(entries)
    }

    fn stat(&self, path: &Path) -> Result<FileEntry, VolumeError> {
        let path = normalize(path);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .get(&path)
            .map(|n| Self::entry_for(&path, n))
            .ok_or_else(|| VolumeError::NotFound {
                path: path.to_string_lossy().to_string(),
            })
    }

    fn create_folder(&self, path: &Path) -> Result<(), VolumeError> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.contains_key(&path) {
            return Err(VolumeError::AlreadyExists {
                path: path.to_string_lossy().to_string(),
            });
        }
        ensure_parents(&mut state, &path);
        state.insert(
            path,
            Node {
                is_dir: true,
                data: Vec::new(),
                modified: None,
            },
        );
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<(), VolumeError> {
        let path = normalize(path);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.contains_key(&path) {
            return Err(VolumeError::NotFound {
                path: path.to_string_lossy().to_string(),
            });
        }
        state.retain(|p, _| p != &path && !p.starts_with(&path));
        Ok(())
    }

    fn rename(&self, path: &Path, new_name: &str) -> Result<(), VolumeError> {
        let path = normalize(path);
        let new_path = path
            .parent()
            .map(|p| p.join(new_name))
            .unwrap_or_else(|| PathBuf::from("/").join(new_name));
        self.move_to(&path, &new_path)
    }

    fn move_entry(&self, path: &Path, new_parent: &Path) -> Result<(), VolumeError> {
        let path = normalize(path);
        let new_parent = normalize(new_parent);
        let name = path.file_name().ok_or_else(|| VolumeError::NotFound {
            path: path.to_string_lossy().to_string(),
        })?;
        self.move_to(&path, &new_parent.join(name))
    }

    fn scan_for_copy(&self, path: &Path) -> Result<CopyScanResult, VolumeError> {
        let path = normalize(path);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let root = state.get(&path).ok_or_else(|| VolumeError::NotFound {
            path: path.to_string_lossy().to_string(),
        })?;
        let mut result = CopyScanResult::default();
        if !root.is_dir {
            result.file_count = 1;
            result.total_bytes = root.data.len() as u64;
            return Ok(result);
        }
        for (p, n) in state.iter() {
            if p != &path && p.starts_with(&path) {
                if n.is_dir {
                    result.dir_count += 1;
                } else {
                    result.file_count += 1;
                    result.total_bytes += n.data.len() as u64;
                }
            }
        }
        Ok(result)
    }

    fn space_info(&self) -> Result<SpaceInfo, VolumeError> {
        let used = self.used_bytes();
        let total = self.capacity.unwrap_or(u64::MAX);
        Ok(SpaceInfo {
            total_bytes: total,
            available_bytes: total.saturating_sub(used),
            used_bytes: used,
        })
    }

    fn export_to_local(&self, source: &Path, local_dest: &Path) -> Result<u64, VolumeError> {
        let source = normalize(source);
        let entry = self.stat(&source)?;
        if entry.is_directory {
            std::fs::create_dir_all(local_dest)?;
            let mut total = 0u64;
            for child in self.list(&source)? {
                total += self.export_to_local(
                    Path::new(&child.path),
                    &local_dest.join(&child.name),
                )?;
            }
            Ok(total)
        } else {
            let data = self.read_file(&source).ok_or_else(|| VolumeError::NotFound {
                path: source.to_string_lossy().to_string(),
            })?;
            let mut file = std::fs::File::create(local_dest)?;
            file.write_all(&data)?;
            Ok(data.len() as u64)
        }
    }

    fn import_from_local(&self, local_source: &Path, dest: &Path) -> Result<u64, VolumeError> {
        let meta = std::fs::metadata(local_source)?;
        if meta.is_dir() {
            if !self.exists(dest) {
                self.create_folder(dest)?;
            }
            let mut total = 0u64;
            for entry in std::fs::read_dir(local_source)? {
                let entry = entry?;
                total +=
                    self.import_from_local(&entry.path(), &dest.join(entry.file_name()))?;
            }
            Ok(total)
        } else {
            let mut data = Vec::with_capacity(meta.len() as usize);
            std::fs::File::open(local_source)?.read_to_end(&mut data)?;
            let size = data.len() as u64;
            self.write_file(dest, data);
            Ok(size)
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming_domain.is_some()
    }

    fn streaming_domain(&self) -> Option<String> {
        self.streaming_domain.clone()
    }

    fn export_streaming(&self, source: &Path) -> Result<Box<dyn VolumeReadStream>, VolumeError> {
        if self.streaming_domain.is_none() {
            return Err(VolumeError::NotSupported);
        }
        let source = normalize(source);
        let data = self.read_file(&source).ok_or_else(|| VolumeError::NotFound {
            path: source.to_string_lossy().to_string(),
        })?;
        Ok(Box::new(InMemoryReadStream {
            total_size: data.len() as u64,
            data,
            offset: 0,
            chunk_size: self.chunk_size,
        }))
    }

    fn import_streaming(
        &self,
        dest: &Path,
        total_size: u64,
        mut stream: Box<dyn VolumeReadStream>,
    ) -> Result<u64, VolumeError> {
        if self.streaming_domain.is_none() {
            return Err(VolumeError::NotSupported);
        }
        let mut data = Vec::with_capacity(total_size.min(64 * 1024 * 1024) as usize);
        while let Some(chunk) = stream.next_chunk() {
            data.extend_from_slice(&chunk?);
        }
        if data.len() as u64 != total_size {
            return Err(VolumeError::Protocol {
                detail: format!("expected {} bytes, received {}", total_size, data.len()),
            });
        }
        if let Some(capacity) = self.capacity {
            if self.used_bytes() + total_size > capacity {
                return Err(VolumeError::StorageFull);
            }
        }
        self.write_file(dest, data);
        Ok(total_size)
    }
}

impl InMemoryVolume {
    fn move_to(&self, from: &Path, to: &Path) -> Result<(), VolumeError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.contains_key(from) {
            return Err(VolumeError::NotFound {
                path: from.to_string_lossy().to_string(),
            });
        }
        if state.contains_key(to) {
            return Err(VolumeError::AlreadyExists {
                path: to.to_string_lossy().to_string(),
            });
        }
        let moved: Vec<(PathBuf, Node)> = state
            .iter()
            .filter(|(p, _)| *p == from || p.starts_with(from))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect();
        state.retain(|p, _| p != from && !p.starts_with(from));
        for (old_path, node) in moved {
            let suffix = old_path.strip_prefix(from).unwrap_or(Path::new(""));
            state.insert(to.join(suffix), node);
        }
        Ok(())
    }
}

struct InMemoryReadStream {
    data: Vec<u8>,
    total_size: u64,
    offset: usize,
    chunk_size: usize,
}

impl VolumeReadStream for InMemoryReadStream {
    fn next_chunk(&mut self) -> Option<Result<Bytes, VolumeError>> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = Bytes::copy_from_slice(&self.data[self.offset..end]);
        self.offset = end;
        Some(Ok(chunk))
    }

    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn bytes_read(&self) -> u64 {
        self.offset as u64
    }
}
