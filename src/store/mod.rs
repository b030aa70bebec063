//! Object store collaborator boundary.
//!
//! The filesystem adapter only ever talks to a bucket through [`Bucket`] and
//! [`ChunkedUpload`]. Backends live in submodules: [`memory`] for an
//! in-process bucket and [`remote`] for `object_store`-backed buckets.

pub mod memory;
pub mod remote;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::Credentials;
use crate::error::StoreError;

/// One object as reported by a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub is_directory_marker: bool,
    pub size: u64,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub recursive: bool,
    pub system_metadata: bool,
    pub custom_metadata: bool,
}

impl ListOptions {
    /// Full listing of every key with all metadata.
    pub fn full() -> Self {
        Self {
            recursive: true,
            system_metadata: true,
            custom_metadata: true,
        }
    }
}

/// Account-level access: resolves (or creates) the bucket a mount works on.
pub trait StoreClient: Send + Sync {
    fn ensure_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, StoreError>;
}

/// Blocking operations on a single bucket.
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    fn list_objects(&self, options: ListOptions) -> Result<Vec<ObjectEntry>, StoreError>;

    fn upload_whole(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    fn begin_chunked_upload(&self, key: &str) -> Result<Box<dyn ChunkedUpload>, StoreError>;

    fn download_whole(&self, key: &str) -> Result<Bytes, StoreError>;

    fn delete_object(&self, key: &str) -> Result<(), StoreError>;
}

/// A sequential upload that becomes visible only once committed.
pub trait ChunkedUpload: Send {
    /// Returns whether the chunk buffer accepted the bytes.
    fn write_chunk(&mut self, data: &[u8]) -> Result<bool, StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;
}

/// Opens a store client for a set of credentials.
pub trait Connector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn StoreClient>, StoreError>;
}

/// Picks a backend from the satellite address scheme: `memory://` for an
/// in-process store, anything else for [`remote::RemoteStore`].
pub struct DefaultConnector {
    memory: memory::MemoryStore,
    remote: remote::RemoteConnector,
}

impl DefaultConnector {
    pub fn new() -> Result<Self, StoreError> {
        Ok(Self {
            memory: memory::MemoryStore::new(),
            remote: remote::RemoteConnector::new()?,
        })
    }
}

impl Connector for DefaultConnector {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn StoreClient>, StoreError> {
        match credentials {
            Credentials::Satellite { address, .. } if address.starts_with("memory://") => {
                Ok(Arc::new(self.memory.clone()))
            }
            _ => self.remote.connect(credentials),
        }
    }
}
