use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::debug;

use super::paths;
use super::sessions::DownloadSession;
use crate::error::StoreError;
use crate::store::{Bucket, ListOptions, ObjectEntry};

/// One full listing of the bucket, markers already folded into directories.
#[derive(Debug)]
pub struct ListingSnapshot {
    pub entries: Vec<ObjectEntry>,
    pub created: Instant,
}

impl ListingSnapshot {
    pub fn from_listing(raw: Vec<ObjectEntry>) -> Self {
        let entries = raw
            .into_iter()
            .filter_map(|entry| {
                let (key, is_marker) = paths::from_listing_key(&entry.key)?;
                Some(ObjectEntry {
                    key,
                    is_directory_marker: entry.is_directory_marker || is_marker,
                    size: if is_marker { 0 } else { entry.size },
                    created: entry.created,
                })
            })
            .collect();
        Self {
            entries,
            created: Instant::now(),
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.created.elapsed() < ttl
    }

    pub fn find(&self, key: &str) -> Option<&ObjectEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Entries strictly below the directory `key`.
    pub fn descendants<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a ObjectEntry> + 'a {
        let prefix = paths::child_prefix(key);
        self.entries
            .iter()
            .filter(move |e| e.key.starts_with(&prefix) && e.key.len() > prefix.len())
    }

    /// A directory with real children but no marker of its own.
    pub fn is_implicit_directory(&self, key: &str) -> bool {
        key != paths::ROOT && self.descendants(key).next().is_some()
    }
}

/// Time-bounded cache of the bucket listing plus per-path download caches.
pub struct ListingCache {
    bucket: Arc<dyn Bucket>,
    ttl: Duration,
    snapshot: Mutex<Option<Arc<ListingSnapshot>>>,
    /// Bumped by every invalidation; a listing that started before an
    /// invalidation is returned but never cached.
    generation: AtomicU64,
    downloads: Cache<String, Arc<DownloadSession>>,
}

impl ListingCache {
    pub fn new(bucket: Arc<dyn Bucket>, ttl: Duration, download_ttl: Duration) -> Self {
        Self {
            bucket,
            ttl,
            snapshot: Mutex::new(None),
            generation: AtomicU64::new(0),
            downloads: Cache::builder().time_to_live(download_ttl).build(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached snapshot if still fresh, otherwise a new full listing.
    pub fn get_all(&self) -> Result<Arc<ListingSnapshot>, StoreError> {
        if let Some(snapshot) = self.snapshot.lock().as_ref() {
            if snapshot.is_fresh(self.ttl) {
                return Ok(Arc::clone(snapshot));
            }
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let raw = self.bucket.list_objects(ListOptions::full())?;
        let snapshot = Arc::new(ListingSnapshot::from_listing(raw));
        debug!(
            "listed bucket {}: {} entries",
            self.bucket.name(),
            snapshot.entries.len()
        );

        let mut slot = self.snapshot.lock();
        if self.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(Arc::clone(&snapshot));
        }
        Ok(snapshot)
    }

    /// Drop the bucket snapshot, and the per-path entries of `path` if given.
    pub fn invalidate(&self, path: Option<&str>) {
        let mut slot = self.snapshot.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        *slot = None;
        drop(slot);

        if let Some(path) = path {
            self.downloads.invalidate(&paths::to_storage_key(path));
            debug!("cache invalidated for {}", path);
        }
    }

    pub fn cached_download(&self, path: &str) -> Option<Arc<DownloadSession>> {
        self.downloads.get(&paths::to_storage_key(path))
    }

    pub fn cache_download(&self, path: &str, session: Arc<DownloadSession>) {
        self.downloads.insert(paths::to_storage_key(path), session);
    }
}
