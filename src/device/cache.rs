//! Path and listing caches for device sessions.
//!
//! Device protocols address objects by opaque handles, but callers speak
//! paths. The path cache remembers path → handle mappings discovered while
//! listing; the listing cache keeps whole directory listings for a short TTL
//! so repeated browsing does not hammer the device.
//!
//! Both caches belong to exactly one session. Reopening a session starts
//! from empty caches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::debug;

use super::protocol::{ObjectHandle, ObjectInfo};

/// Maps device paths to protocol object handles.
#[derive(Debug, Default)]
pub(super) struct PathHandleCache {
    entries: HashMap<PathBuf, ObjectHandle>,
}

impl PathHandleCache {
    pub fn get(&self, path: &Path) -> Option<ObjectHandle> {
        if path == Path::new("/") {
            return Some(ObjectHandle::ROOT);
        }
        self.entries.get(path).copied()
    }

    pub fn insert(&mut self, path: PathBuf, handle: ObjectHandle) {
        self.entries.insert(path, handle);
    }

    pub fn remove(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    /// Drops `path` and every entry beneath it. Used after delete, rename
    /// and move, where stale descendants would map old paths to live
    /// handles.
    pub fn remove_subtree(&mut self, path: &Path) {
        let before = self.entries.len();
        self.entries.retain(|p, _| !p.starts_with(path));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!("Dropped {} handle cache entries under {:?}", dropped, path);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One cached directory listing.
#[derive(Debug, Clone)]
struct CachedListing {
    entries: Vec<ObjectInfo>,
    cached_at: Instant,
}

/// TTL-bounded cache of directory listings, keyed by path.
#[derive(Debug)]
pub(super) struct ListingCache {
    listings: HashMap<PathBuf, CachedListing>,
    ttl: Duration,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            listings: HashMap::new(),
            ttl,
        }
    }

    /// Returns the cached listing if present and not expired.
    pub fn get(&self, path: &Path) -> Option<Vec<ObjectInfo>> {
        let cached = self.listings.get(path)?;
        if cached.cached_at.elapsed() > self.ttl {
            debug!("Listing cache expired for {:?}", path);
            return None;
        }
        Some(cached.entries.clone())
    }

    pub fn insert(&mut self, path: PathBuf, entries: Vec<ObjectInfo>) {
        self.listings.insert(
            path,
            CachedListing {
                entries,
                cached_at: Instant::now(),
            },
        );
    }

    /// Removes one directory's cached listing.
    pub fn invalidate(&mut self, path: &Path) {
        if self.listings.remove(path).is_some() {
            debug!("Invalidated listing cache for {:?}", path);
        }
    }

    /// Removes the listing for `path` and every directory beneath it.
    pub fn invalidate_subtree(&mut self, path: &Path) {
        self.listings.retain(|p, _| !p.starts_with(path));
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }
}
