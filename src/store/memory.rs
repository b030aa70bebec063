use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::{Bucket, ChunkedUpload, ListOptions, ObjectEntry, StoreClient};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    created: DateTime<Utc>,
}

/// Per-bucket state. Objects live in a BTreeMap so listings come back in
/// key order, like a real bucket listing.
#[derive(Default)]
struct BucketState {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    list_calls: AtomicUsize,
    mutations: AtomicUsize,
    failing_uploads: Mutex<HashSet<String>>,
    reject_chunks: AtomicBool,
}

/// In-process object store. Cloning shares the underlying buckets.
#[derive(Clone, Default)]
pub struct MemoryStore {
    buckets: Arc<Mutex<BTreeMap<String, Arc<BucketState>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shortcut for tests: the typed handle of a bucket, created on demand.
    pub fn bucket(&self, name: &str) -> MemoryBucket {
        let state = Arc::clone(
            self.buckets
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(BucketState::default())),
        );
        MemoryBucket {
            name: name.to_string(),
            state,
        }
    }
}

impl StoreClient for MemoryStore {
    fn ensure_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, StoreError> {
        if name.is_empty() {
            return Err(StoreError::Transport("bucket name must be non-empty".into()));
        }
        debug!("memory store: ensure bucket {}", name);
        Ok(Arc::new(self.bucket(name)))
    }
}

#[derive(Clone)]
pub struct MemoryBucket {
    name: String,
    state: Arc<BucketState>,
}

impl MemoryBucket {
    /// Number of `list_objects` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.state.list_calls.load(Ordering::SeqCst)
    }

    /// Number of successful puts, commits and deletes.
    pub fn mutations(&self) -> usize {
        self.state.mutations.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.objects.lock().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.objects.lock().get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.objects.lock().keys().cloned().collect()
    }

    /// Seed an object directly, bypassing mutation accounting.
    pub fn insert(&self, key: &str, data: &[u8]) {
        self.state.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                created: Utc::now(),
            },
        );
    }

    /// Make every whole-object upload to `key` fail with a transport error.
    pub fn fail_uploads_for(&self, key: &str) {
        self.state.failing_uploads.lock().insert(key.to_string());
    }

    /// Make chunked uploads refuse further chunks.
    pub fn reject_chunks(&self, reject: bool) {
        self.state.reject_chunks.store(reject, Ordering::SeqCst);
    }

    fn store(&self, key: &str, data: Bytes) {
        self.state.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data,
                created: Utc::now(),
            },
        );
        self.state.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_objects(&self, options: ListOptions) -> Result<Vec<ObjectEntry>, StoreError> {
        self.state.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.state.objects.lock();
        Ok(objects
            .iter()
            .filter(|(key, _)| options.recursive || !key.contains('/'))
            .map(|(key, obj)| ObjectEntry {
                key: key.clone(),
                is_directory_marker: false,
                size: obj.data.len() as u64,
                created: obj.created,
            })
            .collect())
    }

    fn upload_whole(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        if self.state.failing_uploads.lock().contains(key) {
            return Err(StoreError::Transport(format!("upload of {} failed", key)));
        }
        self.store(key, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn begin_chunked_upload(&self, key: &str) -> Result<Box<dyn ChunkedUpload>, StoreError> {
        Ok(Box::new(MemoryUpload {
            bucket: self.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
            committed: false,
        }))
    }

    fn download_whole(&self, key: &str) -> Result<Bytes, StoreError> {
        self.get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        match self.state.objects.lock().remove(key) {
            Some(_) => {
                self.state.mutations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }
}

struct MemoryUpload {
    bucket: MemoryBucket,
    key: String,
    buffer: Vec<u8>,
    committed: bool,
}

impl ChunkedUpload for MemoryUpload {
    fn write_chunk(&mut self, data: &[u8]) -> Result<bool, StoreError> {
        if self.committed {
            return Err(StoreError::Transport(format!(
                "upload of {} already committed",
                self.key
            )));
        }
        if self.bucket.state.reject_chunks.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.buffer.extend_from_slice(data);
        Ok(true)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.committed {
            return Ok(());
        }
        self.committed = true;
        let data = Bytes::from(std::mem::take(&mut self.buffer));
        self.bucket.store(&self.key, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_upload_is_invisible_until_commit() {
        let store = MemoryStore::new();
        let bucket = store.ensure_bucket("b").unwrap();
        let mut upload = bucket.begin_chunked_upload("k").unwrap();
        assert!(upload.write_chunk(b"he").unwrap());
        assert!(upload.write_chunk(b"llo").unwrap());
        assert!(matches!(
            bucket.download_whole("k"),
            Err(StoreError::NotFound(_))
        ));
        upload.commit().unwrap();
        assert_eq!(&bucket.download_whole("k").unwrap()[..], b"hello");
    }

    #[test]
    fn non_recursive_listing_skips_nested_keys() {
        let store = MemoryStore::new();
        let bucket = store.bucket("b");
        bucket.insert("top", b"1");
        bucket.insert("dir/nested", b"2");
        let shallow = bucket
            .list_objects(ListOptions {
                recursive: false,
                ..ListOptions::full()
            })
            .unwrap();
        assert_eq!(shallow.len(), 1);
        assert_eq!(shallow[0].key, "top");
        assert_eq!(bucket.list_objects(ListOptions::full()).unwrap().len(), 2);
        assert_eq!(bucket.list_calls(), 2);
    }

    #[test]
    fn delete_of_missing_key_is_not_found() {
        let bucket = MemoryStore::new().bucket("b");
        assert!(matches!(
            bucket.delete_object("nope"),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(bucket.mutations(), 0);
    }
}
