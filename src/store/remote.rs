//! `object_store`-backed buckets.
//!
//! The `object_store` API is async; every call here is driven to completion
//! on a shared tokio runtime with `block_on`, so callers see plain blocking
//! operations. Never call into this module from inside that runtime.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload, WriteMultipart};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::{Bucket, ChunkedUpload, Connector, ListOptions, ObjectEntry, StoreClient};
use crate::config::Credentials;
use crate::error::StoreError;

/// Part size for multipart uploads (S3 minimum is 5 MiB).
const CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Parts allowed in flight before a chunk write waits.
const MAX_PARTS_IN_FLIGHT: usize = 4;

const DEFAULT_REGION: &str = "us-east-1";

fn map_err(key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound(key.to_string()),
        other => StoreError::Transport(other.to_string()),
    }
}

pub struct RemoteConnector {
    runtime: Arc<Runtime>,
}

impl RemoteConnector {
    pub fn new() -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("bucketfs-io")
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }
}

impl Connector for RemoteConnector {
    fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn StoreClient>, StoreError> {
        match credentials {
            Credentials::Satellite {
                address,
                api_key,
                passphrase,
            } => {
                let target = match address.strip_prefix("file://") {
                    Some(root) => Target::Local(PathBuf::from(root)),
                    None => Target::S3 {
                        endpoint: address.clone(),
                        access_key_id: api_key.clone(),
                        secret_access_key: passphrase.clone(),
                    },
                };
                Ok(Arc::new(RemoteStore {
                    target,
                    runtime: Arc::clone(&self.runtime),
                }))
            }
            Credentials::AccessGrant { .. } => Err(StoreError::Unsupported(
                "access grants need a grant-aware connector".into(),
            )),
        }
    }
}

enum Target {
    Local(PathBuf),
    S3 {
        endpoint: String,
        access_key_id: String,
        secret_access_key: String,
    },
}

pub struct RemoteStore {
    target: Target,
    runtime: Arc<Runtime>,
}

impl RemoteStore {
    fn open(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
        match &self.target {
            Target::Local(root) => {
                let dir = root.join(bucket);
                std::fs::create_dir_all(&dir)?;
                let store = LocalFileSystem::new_with_prefix(&dir).map_err(|e| map_err(bucket, e))?;
                Ok(Arc::new(store))
            }
            Target::S3 {
                endpoint,
                access_key_id,
                secret_access_key,
            } => {
                let store = AmazonS3Builder::new()
                    .with_endpoint(endpoint.clone())
                    .with_bucket_name(bucket)
                    .with_region(DEFAULT_REGION)
                    .with_access_key_id(access_key_id.clone())
                    .with_secret_access_key(secret_access_key.clone())
                    .with_allow_http(true)
                    .build()
                    .map_err(|e| map_err(bucket, e))?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl StoreClient for RemoteStore {
    fn ensure_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, StoreError> {
        let store = self.open(name)?;
        // Reachability probe: a bucket we cannot list is not mountable.
        self.runtime
            .block_on(async { store.list(None).try_next().await })
            .map_err(|e| map_err(name, e))?;
        info!("bucket {} reachable", name);
        Ok(Arc::new(RemoteBucket {
            name: name.to_string(),
            store,
            runtime: Arc::clone(&self.runtime),
        }))
    }
}

pub struct RemoteBucket {
    name: String,
    store: Arc<dyn ObjectStore>,
    runtime: Arc<Runtime>,
}

impl Bucket for RemoteBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_objects(&self, options: ListOptions) -> Result<Vec<ObjectEntry>, StoreError> {
        let metas: Vec<ObjectMeta> = self
            .runtime
            .block_on(self.store.list(None).try_collect())
            .map_err(|e| map_err(&self.name, e))?;
        debug!("listed {} objects in {}", metas.len(), self.name);
        Ok(metas
            .into_iter()
            .map(|meta| ObjectEntry {
                key: meta.location.to_string(),
                is_directory_marker: false,
                size: meta.size as u64,
                created: meta.last_modified,
            })
            .filter(|entry| options.recursive || !entry.key.contains('/'))
            .collect())
    }

    fn upload_whole(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = ObjectPath::from(key);
        self.runtime
            .block_on(self.store.put(&path, PutPayload::from(data.to_vec())))
            .map(|_| ())
            .map_err(|e| map_err(key, e))
    }

    fn begin_chunked_upload(&self, key: &str) -> Result<Box<dyn ChunkedUpload>, StoreError> {
        let path = ObjectPath::from(key);
        let upload = self
            .runtime
            .block_on(self.store.put_multipart(&path))
            .map_err(|e| map_err(key, e))?;
        Ok(Box::new(RemoteUpload {
            key: key.to_string(),
            path,
            writer: Some(WriteMultipart::new_with_chunk_size(upload, CHUNK_SIZE)),
            written: 0,
            store: Arc::clone(&self.store),
            runtime: Arc::clone(&self.runtime),
        }))
    }

    fn download_whole(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = ObjectPath::from(key);
        self.runtime
            .block_on(async { self.store.get(&path).await?.bytes().await })
            .map_err(|e| map_err(key, e))
    }

    fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let path = ObjectPath::from(key);
        self.runtime
            .block_on(self.store.delete(&path))
            .map_err(|e| map_err(key, e))
    }
}

struct RemoteUpload {
    key: String,
    path: ObjectPath,
    writer: Option<WriteMultipart>,
    written: u64,
    store: Arc<dyn ObjectStore>,
    runtime: Arc<Runtime>,
}

impl ChunkedUpload for RemoteUpload {
    fn write_chunk(&mut self, data: &[u8]) -> Result<bool, StoreError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            StoreError::Transport(format!("upload of {} already committed", self.key))
        })?;
        // WriteMultipart spawns part uploads, so it must run inside the runtime.
        self.runtime
            .block_on(async {
                writer.write(data);
                writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await
            })
            .map_err(|e| map_err(&self.key, e))?;
        self.written += data.len() as u64;
        Ok(true)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        if self.written == 0 {
            // Multipart uploads cannot complete without parts.
            if let Err(e) = self.runtime.block_on(writer.abort()) {
                warn!("aborting empty multipart upload of {} failed: {}", self.key, e);
            }
            return self
                .runtime
                .block_on(self.store.put(&self.path, PutPayload::from(Vec::new())))
                .map(|_| ())
                .map_err(|e| map_err(&self.key, e));
        }
        self.runtime
            .block_on(writer.finish())
            .map(|_| ())
            .map_err(|e| map_err(&self.key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_bucket(dir: &std::path::Path) -> Arc<dyn Bucket> {
        let connector = RemoteConnector::new().unwrap();
        let client = connector
            .connect(&Credentials::Satellite {
                address: format!("file://{}", dir.display()),
                api_key: String::new(),
                passphrase: String::new(),
            })
            .unwrap();
        client.ensure_bucket("photos").unwrap()
    }

    #[test]
    fn local_backend_roundtrips_whole_objects() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = local_bucket(dir.path());
        bucket.upload_whole("a/b.txt", b"hi").unwrap();
        let entries = bucket.list_objects(ListOptions::full()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "a/b.txt");
        assert_eq!(entries[0].size, 2);
        assert_eq!(&bucket.download_whole("a/b.txt").unwrap()[..], b"hi");
        bucket.delete_object("a/b.txt").unwrap();
        assert!(matches!(
            bucket.download_whole("a/b.txt"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn local_backend_commits_chunked_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let bucket = local_bucket(dir.path());
        let mut upload = bucket.begin_chunked_upload("notes.txt").unwrap();
        assert!(upload.write_chunk(b"hello ").unwrap());
        assert!(upload.write_chunk(b"world").unwrap());
        upload.commit().unwrap();
        assert_eq!(&bucket.download_whole("notes.txt").unwrap()[..], b"hello world");
    }

    #[test]
    fn access_grants_are_rejected() {
        let connector = RemoteConnector::new().unwrap();
        let result = connector.connect(&Credentials::AccessGrant {
            grant: "1Abc".into(),
        });
        assert!(matches!(result, Err(StoreError::Unsupported(_))));
    }
}
