//! Path-keyed transfer sessions.
//!
//! Upload and download state is keyed by the logical path rather than by the
//! kernel's per-handle context, so every handle on a path shares one session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::listing::ListingCache;
use super::paths;
use crate::error::{FsError, Result, StoreError};
use crate::store::{Bucket, ChunkedUpload};

pub struct UploadSession {
    path: String,
    bytes_written: AtomicU64,
    upload: Mutex<Box<dyn ChunkedUpload>>,
}

impl UploadSession {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    /// Append to the chunked upload.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let accepted = self.upload.lock().write_chunk(data)?;
        if !accepted {
            return Err(FsError::Transport(StoreError::Rejected(self.path.clone())));
        }
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(data.len())
    }
}

/// Fully fetched object content plus a read cursor.
#[derive(Debug)]
pub struct DownloadSession {
    path: String,
    data: Bytes,
    position: Mutex<u64>,
}

impl DownloadSession {
    pub fn new(path: &str, data: Bytes) -> Self {
        Self {
            path: path.to_string(),
            data,
            position: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> u64 {
        *self.position.lock()
    }

    /// Seek to `offset` and read at most `buf.len()` bytes, never past the end.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let mut position = self.position.lock();
        *position = offset;
        let available = self.len().saturating_sub(offset);
        let n = (buf.len() as u64).min(available) as usize;
        if n > 0 {
            let start = offset as usize;
            buf[..n].copy_from_slice(&self.data[start..start + n]);
        }
        *position += n as u64;
        n
    }
}

pub struct SessionTable {
    bucket: Arc<dyn Bucket>,
    cache: Arc<ListingCache>,
    uploads: DashMap<String, Arc<UploadSession>>,
}

impl SessionTable {
    pub fn new(bucket: Arc<dyn Bucket>, cache: Arc<ListingCache>) -> Self {
        Self {
            bucket,
            cache,
            uploads: DashMap::new(),
        }
    }

    /// Open the upload for `path`, or return the one already open.
    pub fn begin_upload(&self, path: &str) -> Result<Arc<UploadSession>> {
        let key = paths::to_storage_key(path);
        // The shard stays locked while the upload starts, so concurrent
        // opens of one path cannot start two uploads.
        match self.uploads.entry(key) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let upload = self.bucket.begin_chunked_upload(entry.key())?;
                let session = Arc::new(UploadSession {
                    path: path.to_string(),
                    bytes_written: AtomicU64::new(0),
                    upload: Mutex::new(upload),
                });
                debug!("upload session opened for {}", path);
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn upload(&self, path: &str) -> Option<Arc<UploadSession>> {
        self.uploads
            .get(&paths::to_storage_key(path))
            .map(|s| Arc::clone(s.value()))
    }

    pub fn has_upload(&self, path: &str) -> bool {
        self.uploads.contains_key(&paths::to_storage_key(path))
    }

    /// Append to the open upload of `path`. Writing without one is an error.
    pub fn write(&self, path: &str, data: &[u8]) -> Result<usize> {
        let session = self.upload(path).ok_or_else(|| FsError::ProtocolViolation {
            path: path.to_string(),
            reason: "write without an open upload session",
        })?;
        session.write(data)
    }

    /// Finalize and forget the upload of `path`. Returns whether one was open.
    pub fn commit(&self, path: &str) -> Result<bool> {
        let Some((_, session)) = self.uploads.remove(&paths::to_storage_key(path)) else {
            return Ok(false);
        };
        let result = session.upload.lock().commit();
        self.cache.invalidate(Some(path));
        result?;
        info!(
            "committed {} ({} bytes)",
            path,
            session.bytes_written()
        );
        Ok(true)
    }

    /// Paths with uploads that were never committed.
    pub fn open_uploads(&self) -> Vec<String> {
        self.uploads
            .iter()
            .map(|s| s.value().path().to_string())
            .collect()
    }

    /// Content of `path`, fetched once and reused by later reads.
    pub fn begin_download(&self, path: &str) -> Result<Arc<DownloadSession>> {
        if let Some(session) = self.cache.cached_download(path) {
            return Ok(session);
        }
        let data = self.bucket.download_whole(&paths::to_storage_key(path))?;
        debug!("downloaded {} ({} bytes)", path, data.len());
        let session = Arc::new(DownloadSession::new(path, data));
        self.cache.cache_download(path, Arc::clone(&session));
        Ok(session)
    }

    /// Nothing to release: the session stays cached until invalidated or expired.
    pub fn end_download(&self, _path: &str) {}
}
