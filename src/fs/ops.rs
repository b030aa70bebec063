//! The callback surface a kernel-side driver invokes, one call per operation.

use std::ops::BitOr;
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Requested access rights of an open, in the driver's bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessMask(pub u32);

impl AccessMask {
    pub const READ_DATA: AccessMask = AccessMask(0x0000_0001);
    pub const WRITE_DATA: AccessMask = AccessMask(0x0000_0002);
    pub const APPEND_DATA: AccessMask = AccessMask(0x0000_0004);
    pub const READ_EXTENDED_ATTRIBUTES: AccessMask = AccessMask(0x0000_0008);
    pub const WRITE_EXTENDED_ATTRIBUTES: AccessMask = AccessMask(0x0000_0010);
    pub const EXECUTE: AccessMask = AccessMask(0x0000_0020);
    pub const READ_ATTRIBUTES: AccessMask = AccessMask(0x0000_0080);
    pub const WRITE_ATTRIBUTES: AccessMask = AccessMask(0x0000_0100);
    pub const DELETE: AccessMask = AccessMask(0x0001_0000);
    pub const READ_PERMISSIONS: AccessMask = AccessMask(0x0002_0000);
    pub const CHANGE_PERMISSIONS: AccessMask = AccessMask(0x0004_0000);
    pub const SYNCHRONIZE: AccessMask = AccessMask(0x0010_0000);
    pub const GENERIC_ALL: AccessMask = AccessMask(0x1000_0000);
    pub const GENERIC_EXECUTE: AccessMask = AccessMask(0x2000_0000);
    pub const GENERIC_WRITE: AccessMask = AccessMask(0x4000_0000);
    pub const GENERIC_READ: AccessMask = AccessMask(0x8000_0000);

    /// Rights that touch file content rather than metadata.
    pub const DATA: AccessMask = AccessMask(
        Self::READ_DATA.0
            | Self::WRITE_DATA.0
            | Self::APPEND_DATA.0
            | Self::EXECUTE.0
            | Self::GENERIC_EXECUTE.0
            | Self::GENERIC_WRITE.0
            | Self::GENERIC_READ.0,
    );

    pub const DATA_WRITE: AccessMask = AccessMask(
        Self::WRITE_DATA.0 | Self::APPEND_DATA.0 | Self::GENERIC_WRITE.0 | Self::GENERIC_ALL.0,
    );

    pub fn contains(self, other: AccessMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: AccessMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Only attributes or security information are requested.
    pub fn is_metadata_only(self) -> bool {
        !self.intersects(Self::DATA)
    }

    pub fn wants_write(self) -> bool {
        self.intersects(Self::DATA_WRITE)
    }
}

impl BitOr for AccessMask {
    type Output = AccessMask;

    fn bitor(self, rhs: AccessMask) -> AccessMask {
        AccessMask(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    CreateNew,
    Create,
    Open,
    OpenOrCreate,
    Truncate,
    Append,
}

/// Outcome of a successful create/open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    Opened,
    Created,
    /// `Create`/`OpenOrCreate` found the file already there.
    OpenedExisting,
}

/// Per-handle context the driver keeps between calls on one open.
/// Transfer state lives in the session table, never here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileContext {
    pub is_directory: bool,
    pub delete_on_close: bool,
    /// Opened for writing: the first write may start the upload.
    pub write_intent: bool,
}

impl FileContext {
    pub fn directory() -> Self {
        Self {
            is_directory: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInformation {
    pub file_name: String,
    pub is_directory: bool,
    pub length: u64,
    pub creation_time: DateTime<Utc>,
    pub last_access_time: DateTime<Utc>,
    pub last_write_time: DateTime<Utc>,
}

impl FileInformation {
    pub fn file(file_name: &str, length: u64, time: DateTime<Utc>) -> Self {
        Self {
            file_name: file_name.to_string(),
            is_directory: false,
            length,
            creation_time: time,
            last_access_time: time,
            last_write_time: time,
        }
    }

    pub fn directory(file_name: &str, time: DateTime<Utc>) -> Self {
        Self {
            is_directory: true,
            ..Self::file(file_name, 0, time)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub free_bytes_available: u64,
    pub total_bytes: u64,
    pub total_free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInformation {
    pub label: String,
    pub file_system_name: String,
    pub max_component_length: u32,
    pub case_preserving: bool,
    pub case_sensitive: bool,
}

pub trait FileSystemOperations: Send + Sync {
    fn create_file(
        &self,
        path: &str,
        access: AccessMask,
        mode: CreateMode,
        info: &mut FileContext,
    ) -> Result<CreateDisposition>;

    fn read_file(&self, path: &str, buf: &mut [u8], offset: u64, info: &FileContext)
        -> Result<usize>;

    /// Sequential append; `offset` is accepted but not used to seek.
    fn write_file(&self, path: &str, data: &[u8], offset: u64, info: &FileContext)
        -> Result<usize>;

    fn flush_file_buffers(&self, path: &str, info: &FileContext) -> Result<()>;

    fn get_file_information(&self, path: &str, info: &FileContext) -> Result<FileInformation>;

    fn find_files(&self, path: &str, info: &FileContext) -> Result<Vec<FileInformation>> {
        self.find_files_with_pattern(path, "*", info)
    }

    fn find_files_with_pattern(
        &self,
        path: &str,
        pattern: &str,
        info: &FileContext,
    ) -> Result<Vec<FileInformation>>;

    fn set_file_attributes(&self, path: &str, attributes: u32, info: &FileContext) -> Result<()>;

    fn set_file_time(
        &self,
        path: &str,
        creation: Option<SystemTime>,
        last_access: Option<SystemTime>,
        last_write: Option<SystemTime>,
        info: &FileContext,
    ) -> Result<()>;

    /// Validates the delete; the object goes away at cleanup.
    fn delete_file(&self, path: &str, info: &FileContext) -> Result<()>;

    fn delete_directory(&self, path: &str, info: &FileContext) -> Result<()>;

    fn move_file(&self, old: &str, new: &str, replace: bool, info: &FileContext) -> Result<()>;

    fn set_end_of_file(&self, path: &str, length: u64, info: &FileContext) -> Result<()>;

    fn set_allocation_size(&self, path: &str, length: u64, info: &FileContext) -> Result<()>;

    fn lock_file(&self, path: &str, offset: u64, length: u64, info: &FileContext) -> Result<()>;

    fn unlock_file(&self, path: &str, offset: u64, length: u64, info: &FileContext)
        -> Result<()>;

    fn get_disk_free_space(&self, info: &FileContext) -> Result<DiskSpace>;

    fn get_volume_information(&self, info: &FileContext) -> Result<VolumeInformation>;

    fn get_file_security(&self, path: &str, info: &FileContext) -> Result<Vec<u8>>;

    fn set_file_security(&self, path: &str, descriptor: &[u8], info: &FileContext)
        -> Result<()>;

    fn find_streams(&self, path: &str, info: &FileContext) -> Result<Vec<FileInformation>>;

    /// Last handle on the path is going away.
    fn cleanup(&self, path: &str, info: &FileContext) -> Result<()>;

    fn close_file(&self, path: &str, info: &FileContext) -> Result<()>;

    fn mounted(&self) -> Result<()>;

    fn unmounted(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_only_access() {
        assert!(AccessMask::READ_ATTRIBUTES.is_metadata_only());
        assert!((AccessMask::READ_ATTRIBUTES | AccessMask::SYNCHRONIZE).is_metadata_only());
        assert!((AccessMask::DELETE | AccessMask::READ_PERMISSIONS).is_metadata_only());
        assert!(!AccessMask::GENERIC_READ.is_metadata_only());
        assert!(!(AccessMask::READ_ATTRIBUTES | AccessMask::APPEND_DATA).is_metadata_only());
    }

    #[test]
    fn write_access() {
        assert!(AccessMask::GENERIC_WRITE.wants_write());
        assert!(AccessMask::APPEND_DATA.wants_write());
        assert!(!AccessMask::GENERIC_READ.wants_write());
        let mask = AccessMask::DELETE | AccessMask::SYNCHRONIZE;
        assert!(mask.contains(AccessMask::DELETE));
        assert!(!mask.contains(AccessMask::DELETE | AccessMask::READ_DATA));
    }
}
