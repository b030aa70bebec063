pub mod listing;
pub mod ops;
pub mod paths;
pub mod pattern;
pub mod sessions;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use self::listing::ListingCache;
use self::ops::{
    AccessMask, CreateDisposition, CreateMode, DiskSpace, FileContext, FileInformation,
    FileSystemOperations, VolumeInformation,
};
use self::sessions::SessionTable;
use crate::config::FsSettings;
use crate::error::{FsError, Result, StoreError};
use crate::store::{Bucket, ObjectEntry};

pub const FILE_SYSTEM_NAME: &str = "bucketfs";
const MAX_COMPONENT_LENGTH: u32 = 255;

/// What a caller path currently names, according to the listing.
#[derive(Debug)]
enum Lookup {
    Missing,
    File(ObjectEntry),
    /// Marker-backed directories carry the marker's timestamp.
    Directory(Option<DateTime<Utc>>),
}

/// Filesystem operations over one bucket.
pub struct BucketFs {
    bucket: Arc<dyn Bucket>,
    listing: Arc<ListingCache>,
    sessions: SessionTable,
    settings: FsSettings,
}

impl BucketFs {
    pub fn new(bucket: Arc<dyn Bucket>, settings: FsSettings) -> Self {
        let listing = Arc::new(ListingCache::new(
            Arc::clone(&bucket),
            settings.listing_ttl,
            settings.download_ttl,
        ));
        let sessions = SessionTable::new(Arc::clone(&bucket), Arc::clone(&listing));
        Self {
            bucket,
            listing,
            sessions,
            settings,
        }
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.name()
    }

    pub fn listing(&self) -> &ListingCache {
        &self.listing
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    fn lookup(&self, path: &str) -> Result<Lookup> {
        if paths::is_root(path) {
            return Ok(Lookup::Directory(None));
        }
        let key = paths::to_storage_key(path);
        let snapshot = self.listing.get_all()?;
        Ok(match snapshot.find(&key) {
            Some(entry) if entry.is_directory_marker => Lookup::Directory(Some(entry.created)),
            Some(entry) => Lookup::File(entry.clone()),
            None if snapshot.is_implicit_directory(&key) => Lookup::Directory(None),
            None => Lookup::Missing,
        })
    }

    fn create_folder(&self, path: &str) -> Result<()> {
        let marker = paths::to_directory_marker_key(path);
        self.bucket.upload_whole(&marker, &[])?;
        self.listing.invalidate(Some(path));
        info!("created directory {}", path);
        Ok(())
    }

    fn has_descendants(&self, key: &str) -> Result<bool> {
        Ok(self.listing.get_all()?.descendants(key).next().is_some())
    }

    /// Copy `old_key` to `new_key`, then drop the original. The original is
    /// only deleted once the copy is stored.
    fn transfer(&self, old_key: &str, new_key: &str, replace: bool) -> Result<()> {
        if replace {
            ignore_missing(self.bucket.delete_object(new_key))?;
        }
        let data = self.bucket.download_whole(old_key)?;
        self.bucket.upload_whole(new_key, &data)?;
        self.bucket.delete_object(old_key)?;
        Ok(())
    }

    fn move_entry(&self, old: &str, new: &str, replace: bool) -> Result<()> {
        let old_key = paths::to_storage_key(old);
        let new_key = paths::to_storage_key(new);
        if old_key == new_key {
            return Ok(());
        }

        let source_is_dir = match self.lookup(old)? {
            Lookup::Missing => return Err(FsError::NotFound(old.to_string())),
            Lookup::File(_) => false,
            Lookup::Directory(_) => {
                if paths::is_root(old) {
                    return Err(FsError::AccessDenied(old.to_string()));
                }
                // Only empty directories can be moved: their marker is the whole directory.
                if self.has_descendants(&old_key)? {
                    return Err(FsError::DirectoryNotEmpty(old.to_string()));
                }
                true
            }
        };

        match self.lookup(new)? {
            Lookup::Missing => {}
            _ if !replace => return Err(FsError::AlreadyExists(new.to_string())),
            Lookup::File(_) if source_is_dir => {
                return Err(FsError::AccessDenied(new.to_string()))
            }
            Lookup::Directory(_) if !source_is_dir => {
                return Err(FsError::AccessDenied(new.to_string()))
            }
            Lookup::Directory(_) if self.has_descendants(&new_key)? => {
                return Err(FsError::DirectoryNotEmpty(new.to_string()))
            }
            _ => {}
        }

        if source_is_dir {
            self.transfer(
                &paths::to_directory_marker_key(old),
                &paths::to_directory_marker_key(new),
                replace,
            )
        } else {
            self.transfer(&old_key, &new_key, replace)
        }
    }

    fn delete_tree(&self, path: &str) -> Result<()> {
        let key = paths::to_storage_key(path);
        let snapshot = self.listing.get_all()?;
        for entry in snapshot.descendants(&key) {
            let object_key = if entry.is_directory_marker {
                paths::to_directory_marker_key(&entry.key)
            } else {
                entry.key.clone()
            };
            ignore_missing(self.bucket.delete_object(&object_key))?;
        }
        ignore_missing(
            self.bucket
                .delete_object(&paths::to_directory_marker_key(path)),
        )?;
        Ok(())
    }
}

fn ignore_missing(result: std::result::Result<(), StoreError>) -> std::result::Result<(), StoreError> {
    match result {
        Err(StoreError::NotFound(_)) => Ok(()),
        other => other,
    }
}

impl FileSystemOperations for BucketFs {
    fn create_file(
        &self,
        path: &str,
        access: AccessMask,
        mode: CreateMode,
        info: &mut FileContext,
    ) -> Result<CreateDisposition> {
        debug!(
            "create_file(path={}, access={:#x}, mode={:?}, directory={})",
            path, access.0, mode, info.is_directory
        );

        if info.is_directory {
            return match mode {
                CreateMode::CreateNew => {
                    if !matches!(self.lookup(path)?, Lookup::Missing) {
                        return Err(FsError::AlreadyExists(path.to_string()));
                    }
                    self.create_folder(path)?;
                    Ok(CreateDisposition::Created)
                }
                _ => Ok(CreateDisposition::Opened),
            };
        }

        let found = self.lookup(path)?;
        let exists = !matches!(found, Lookup::Missing);
        let is_directory = matches!(found, Lookup::Directory(_));

        match mode {
            CreateMode::Open => {
                if !exists {
                    return Err(FsError::NotFound(path.to_string()));
                }
                if access.is_metadata_only() || is_directory {
                    if is_directory
                        && access.contains(AccessMask::DELETE)
                        && !access.contains(AccessMask::SYNCHRONIZE)
                    {
                        return Err(FsError::AccessDenied(path.to_string()));
                    }
                    info.is_directory = is_directory;
                    return Ok(CreateDisposition::Opened);
                }
                info.write_intent = access.wants_write();
                Ok(CreateDisposition::Opened)
            }
            CreateMode::CreateNew => {
                if exists {
                    return Err(FsError::AlreadyExists(path.to_string()));
                }
                self.sessions.begin_upload(path)?;
                self.listing.invalidate(Some(path));
                info.write_intent = true;
                Ok(CreateDisposition::Created)
            }
            CreateMode::Truncate => {
                if !exists {
                    return Err(FsError::NotFound(path.to_string()));
                }
                info.write_intent = true;
                Ok(CreateDisposition::Opened)
            }
            CreateMode::Create | CreateMode::OpenOrCreate | CreateMode::Append => {
                if is_directory {
                    info.is_directory = true;
                    return Ok(CreateDisposition::OpenedExisting);
                }
                info.write_intent = !exists || access.wants_write();
                if exists {
                    Ok(CreateDisposition::OpenedExisting)
                } else {
                    Ok(CreateDisposition::Created)
                }
            }
        }
    }

    fn read_file(
        &self,
        path: &str,
        buf: &mut [u8],
        offset: u64,
        info: &FileContext,
    ) -> Result<usize> {
        debug!("read_file(path={}, offset={}, len={})", path, offset, buf.len());
        if info.is_directory {
            return Err(FsError::ProtocolViolation {
                path: path.to_string(),
                reason: "read on a directory",
            });
        }
        let download = self.sessions.begin_download(path)?;
        Ok(download.read_at(buf, offset))
    }

    fn write_file(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        info: &FileContext,
    ) -> Result<usize> {
        debug!("write_file(path={}, offset={}, len={})", path, offset, data.len());
        if info.write_intent {
            self.sessions.begin_upload(path)?;
        }
        let written = self.sessions.write(path, data)?;
        self.listing.invalidate(Some(path));
        Ok(written)
    }

    fn flush_file_buffers(&self, path: &str, _info: &FileContext) -> Result<()> {
        debug!("flush_file_buffers(path={})", path);
        Err(FsError::NotImplemented("flush"))
    }

    fn get_file_information(&self, path: &str, info: &FileContext) -> Result<FileInformation> {
        debug!("get_file_information(path={})", path);
        let name = paths::file_name(path);
        if self.sessions.has_upload(path) {
            return Ok(FileInformation::file(name, 0, Utc::now()));
        }
        if paths::is_root(path) || info.is_directory {
            return Ok(FileInformation::directory(name, Utc::now()));
        }
        match self.lookup(path)? {
            Lookup::File(entry) => Ok(FileInformation::file(name, entry.size, entry.created)),
            Lookup::Directory(created) => Ok(FileInformation::directory(
                name,
                created.unwrap_or_else(Utc::now),
            )),
            Lookup::Missing => Err(FsError::NotFound(path.to_string())),
        }
    }

    fn find_files_with_pattern(
        &self,
        path: &str,
        pattern: &str,
        _info: &FileContext,
    ) -> Result<Vec<FileInformation>> {
        debug!("find_files_with_pattern(path={}, pattern={})", path, pattern);
        let prefix = paths::child_prefix(&paths::to_storage_key(path));
        let snapshot = self.listing.get_all()?;

        let mut seen = HashSet::new();
        let mut directories = Vec::new();
        let mut files = Vec::new();
        for entry in &snapshot.entries {
            let Some((name, nested)) = paths::immediate_child(&prefix, &entry.key) else {
                continue;
            };
            if !pattern::matches(pattern, name) {
                continue;
            }
            if nested || entry.is_directory_marker {
                if seen.insert(name) {
                    directories.push(FileInformation::directory(name, entry.created));
                }
            } else {
                files.push(FileInformation::file(name, entry.size, entry.created));
            }
        }

        directories.extend(files);
        Ok(directories)
    }

    fn set_file_attributes(&self, path: &str, attributes: u32, _info: &FileContext) -> Result<()> {
        debug!("set_file_attributes(path={}, attributes={:#x})", path, attributes);
        Ok(())
    }

    fn set_file_time(
        &self,
        path: &str,
        _creation: Option<SystemTime>,
        _last_access: Option<SystemTime>,
        _last_write: Option<SystemTime>,
        _info: &FileContext,
    ) -> Result<()> {
        debug!("set_file_time(path={})", path);
        Ok(())
    }

    fn delete_file(&self, path: &str, _info: &FileContext) -> Result<()> {
        debug!("delete_file(path={})", path);
        if !self.sessions.has_upload(path) {
            match self.lookup(path)? {
                Lookup::Missing => return Err(FsError::NotFound(path.to_string())),
                Lookup::Directory(_) => return Err(FsError::AccessDenied(path.to_string())),
                Lookup::File(_) => {}
            }
        }
        self.listing.invalidate(Some(path));
        Ok(())
    }

    fn delete_directory(&self, path: &str, _info: &FileContext) -> Result<()> {
        debug!("delete_directory(path={})", path);
        if paths::is_root(path) {
            return Err(FsError::AccessDenied(path.to_string()));
        }
        let result = self.delete_tree(path);
        self.listing.invalidate(Some(path));
        result
    }

    fn move_file(&self, old: &str, new: &str, replace: bool, _info: &FileContext) -> Result<()> {
        debug!("move_file(old={}, new={}, replace={})", old, new, replace);
        let result = self.move_entry(old, new, replace);
        self.listing.invalidate(Some(old));
        self.listing.invalidate(Some(new));
        if result.is_ok() {
            info!("moved {} to {}", old, new);
        }
        result
    }

    fn set_end_of_file(&self, path: &str, length: u64, _info: &FileContext) -> Result<()> {
        debug!("set_end_of_file(path={}, length={})", path, length);
        self.sessions.begin_upload(path)?;
        self.listing.invalidate(Some(path));
        Ok(())
    }

    fn set_allocation_size(&self, path: &str, length: u64, _info: &FileContext) -> Result<()> {
        debug!("set_allocation_size(path={}, length={})", path, length);
        self.bucket
            .upload_whole(&paths::to_storage_key(path), &[])?;
        self.listing.invalidate(Some(path));
        Ok(())
    }

    fn lock_file(&self, _path: &str, _offset: u64, _length: u64, _info: &FileContext) -> Result<()> {
        Err(FsError::NotImplemented("lock"))
    }

    fn unlock_file(
        &self,
        _path: &str,
        _offset: u64,
        _length: u64,
        _info: &FileContext,
    ) -> Result<()> {
        Err(FsError::NotImplemented("unlock"))
    }

    fn get_disk_free_space(&self, _info: &FileContext) -> Result<DiskSpace> {
        Ok(DiskSpace {
            free_bytes_available: self.settings.free_bytes,
            total_bytes: self.settings.total_bytes,
            total_free_bytes: self.settings.free_bytes,
        })
    }

    fn get_volume_information(&self, _info: &FileContext) -> Result<VolumeInformation> {
        Ok(VolumeInformation {
            label: self.bucket.name().to_string(),
            file_system_name: FILE_SYSTEM_NAME.to_string(),
            max_component_length: MAX_COMPONENT_LENGTH,
            case_preserving: true,
            case_sensitive: true,
        })
    }

    fn get_file_security(&self, _path: &str, _info: &FileContext) -> Result<Vec<u8>> {
        Err(FsError::NotImplemented("security descriptors"))
    }

    fn set_file_security(
        &self,
        path: &str,
        _descriptor: &[u8],
        _info: &FileContext,
    ) -> Result<()> {
        Err(FsError::AccessDenied(path.to_string()))
    }

    fn find_streams(&self, _path: &str, _info: &FileContext) -> Result<Vec<FileInformation>> {
        Err(FsError::NotImplemented("alternate data streams"))
    }

    fn cleanup(&self, path: &str, info: &FileContext) -> Result<()> {
        debug!("cleanup(path={}, delete_on_close={})", path, info.delete_on_close);
        let committed = self.sessions.commit(path);
        if let Err(e) = &committed {
            warn!("commit of {} failed during cleanup: {}", path, e);
        }

        // Directories go away through delete_directory.
        if info.delete_on_close && !info.is_directory {
            let deleted = self
                .bucket
                .delete_object(&paths::to_storage_key(path));
            self.listing.invalidate(Some(path));
            deleted?;
            info!("deleted {}", path);
        }
        committed.map(|_| ())
    }

    fn close_file(&self, path: &str, _info: &FileContext) -> Result<()> {
        debug!("close_file(path={})", path);
        self.sessions.commit(path)?;
        self.sessions.end_download(path);
        Ok(())
    }

    fn mounted(&self) -> Result<()> {
        info!("bucket {} mounted", self.bucket.name());
        Ok(())
    }

    fn unmounted(&self) -> Result<()> {
        for path in self.sessions.open_uploads() {
            warn!("upload of {} was never committed", path);
        }
        info!("bucket {} unmounted", self.bucket.name());
        Ok(())
    }
}
