//! FUSE front end: translates inode/handle calls into path-based
//! [`FileSystemOperations`] calls.

pub mod handles;
pub mod inodes;

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    AccessFlags, BsdFileFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags,
    Generation, INodeNo, KernelConfig, LockOwner, OpenFlags, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, RenameFlags,
    Request, TimeOrNow, WriteFlags,
};
use tracing::{debug, info, warn};

use self::handles::HandleTable;
use self::inodes::{InodeTable, ROOT_INO};
use crate::error::{FsError, MountError, Status};
use crate::fs::ops::{AccessMask, CreateMode, FileContext, FileInformation, FileSystemOperations};
use crate::fs::{paths, BucketFs, FILE_SYSTEM_NAME};
use crate::mount::Driver;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 512;

fn raw_errno(code: i32) -> Errno {
    Errno::from(std::io::Error::from_raw_os_error(code))
}

fn errno(err: &FsError) -> Errno {
    match err.status() {
        Status::NotFound => Errno::ENOENT,
        Status::AlreadyExists => raw_errno(libc::EEXIST),
        Status::AccessDenied => Errno::EACCES,
        Status::DirectoryNotEmpty => raw_errno(libc::ENOTEMPTY),
        Status::NotImplemented => raw_errno(libc::ENOSYS),
        Status::Success | Status::Error => Errno::EIO,
    }
}

fn access_for(flags: i32) -> AccessMask {
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => AccessMask::GENERIC_READ,
        libc::O_WRONLY => AccessMask::GENERIC_WRITE,
        _ => AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
    }
}

fn system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(st) => st,
        TimeOrNow::Now => SystemTime::now(),
    }
}

pub struct FuseBridge<F: FileSystemOperations> {
    fs: Arc<F>,
    inodes: InodeTable,
    handles: HandleTable,
}

impl<F: FileSystemOperations> FuseBridge<F> {
    pub fn new(fs: Arc<F>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
        }
    }

    fn path_of(&self, ino: INodeNo) -> Result<String, Errno> {
        self.inodes.get_path(u64::from(ino)).ok_or(Errno::ENOENT)
    }

    fn child_path(&self, parent: INodeNo, name: &OsStr) -> Result<String, Errno> {
        let parent = self.path_of(parent)?;
        let name = name.to_str().ok_or(Errno::EINVAL)?;
        Ok(paths::join(&parent, name))
    }

    fn handle(&self, fh: u64) -> Result<(String, FileContext), Errno> {
        self.handles
            .get(fh)
            .map(|h| (h.path.clone(), h.context.clone()))
            .ok_or(Errno::EBADF)
    }

    fn context_of(&self, fh: Option<FileHandle>) -> FileContext {
        fh.and_then(|fh| self.handles.get(u64::from(fh)))
            .map(|h| h.context.clone())
            .unwrap_or_default()
    }

    fn to_attr(ino: u64, info: &FileInformation) -> FileAttr {
        let mtime = SystemTime::from(info.last_write_time);
        let (kind, perm, nlink) = if info.is_directory {
            (FileType::Directory, 0o755, 2)
        } else {
            (FileType::RegularFile, 0o644, 1)
        };
        FileAttr {
            ino: INodeNo(ino),
            size: info.length,
            blocks: info.length.div_ceil(BLOCK_SIZE as u64),
            atime: SystemTime::from(info.last_access_time),
            mtime,
            ctime: mtime,
            crtime: SystemTime::from(info.creation_time),
            kind,
            perm,
            nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Stat `path` and register its inode.
    fn stat(&self, path: &str, info: &FileContext) -> Result<FileAttr, Errno> {
        let found = self
            .fs
            .get_file_information(path, info)
            .map_err(|e| errno(&e))?;
        Ok(Self::to_attr(self.inodes.ino_for(path), &found))
    }

    /// Open (or with `create`, exclusively create) a regular file and
    /// allocate its handle.
    fn open_handle(&self, path: &str, flags: i32, create: bool) -> Result<u64, Errno> {
        let access = access_for(flags);
        let truncate = !create && flags & libc::O_TRUNC != 0 && access.wants_write();
        let (access, mode) = if create {
            (access | AccessMask::GENERIC_WRITE, CreateMode::CreateNew)
        } else if truncate {
            (access, CreateMode::Truncate)
        } else {
            (access, CreateMode::Open)
        };

        let mut context = FileContext::default();
        self.fs
            .create_file(path, access, mode, &mut context)
            .map_err(|e| errno(&e))?;
        if truncate {
            self.fs
                .set_end_of_file(path, 0, &context)
                .map_err(|e| errno(&e))?;
        }
        Ok(self.handles.alloc(path.to_string(), context))
    }

    fn write_handle(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize, Errno> {
        let (path, context) = self.handle(fh)?;
        self.fs
            .write_file(&path, data, offset, &context)
            .map_err(|e| errno(&e))
    }

    /// Flush fires on every close(2) of a duplicated descriptor, so the
    /// upload stays open until release.
    fn flush_handle(&self, fh: u64) -> Result<(), Errno> {
        let Ok((path, context)) = self.handle(fh) else {
            return Ok(());
        };
        match self.fs.flush_file_buffers(&path, &context) {
            Err(e) if e.status() != Status::NotImplemented => Err(errno(&e)),
            _ => Ok(()),
        }
    }

    /// Commit any upload of the handle and forget it.
    fn release_handle(&self, fh: u64) -> Result<(), FsError> {
        let Some(handle) = self.handles.remove(fh) else {
            return Ok(());
        };
        let cleaned = self.fs.cleanup(&handle.path, &handle.context);
        let closed = self.fs.close_file(&handle.path, &handle.context);
        cleaned.and(closed)
    }

    fn apply_setattr(
        &self,
        path: &str,
        mode: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        crtime: Option<SystemTime>,
        fh: Option<FileHandle>,
    ) -> Result<FileContext, FsError> {
        let context = self.context_of(fh);
        match size {
            Some(0) => self.fs.set_allocation_size(path, 0, &context)?,
            // The open upload supplies the new content.
            Some(len) if context.write_intent => self.fs.set_end_of_file(path, len, &context)?,
            // Objects cannot be resized in place.
            Some(len) => {
                if self.fs.get_file_information(path, &context)?.length != len {
                    return Err(FsError::NotImplemented("resize"));
                }
            }
            None => {}
        }
        if atime.is_some() || mtime.is_some() || crtime.is_some() {
            self.fs.set_file_time(
                path,
                crtime,
                atime.map(system_time),
                mtime.map(system_time),
                &context,
            )?;
        }
        if let Some(mode) = mode {
            self.fs.set_file_attributes(path, mode, &context)?;
        }
        Ok(context)
    }
}

impl<F: FileSystemOperations + 'static> Filesystem for FuseBridge<F> {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        self.fs
            .mounted()
            .map_err(|e| std::io::Error::other(e.to_string()))
    }

    fn destroy(&mut self) {
        if let Err(e) = self.fs.unmounted() {
            warn!("unmount notification failed: {}", e);
        }
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", u64::from(parent), name);
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.stat(&path, &FileContext::default()));
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, fh: Option<FileHandle>, reply: ReplyAttr) {
        debug!("getattr(ino={})", u64::from(ino));
        let result = self
            .path_of(ino)
            .and_then(|path| self.stat(&path, &self.context_of(fh)));
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FileHandle>,
        crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, size={:?})", u64::from(ino), size);
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let context = match self.apply_setattr(&path, mode, size, atime, mtime, crtime, fh) {
            Ok(context) => context,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };
        match self.stat(&path, &context) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let raw_flags = flags.0;
        debug!("open(ino={}, flags={})", u64::from(ino), raw_flags);
        let opened = self
            .path_of(ino)
            .and_then(|path| self.open_handle(&path, raw_flags, false));
        match opened {
            Ok(fh) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let fh = u64::from(fh);
        debug!("read(ino={}, fh={}, offset={}, size={})", u64::from(ino), fh, offset, size);
        let (path, context) = match self.handle(fh) {
            Ok(h) => h,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut buf = vec![0u8; size as usize];
        match self.fs.read_file(&path, &mut buf, offset, &context) {
            Ok(n) => {
                buf.truncate(n);
                reply.data(&buf);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let fh = u64::from(fh);
        debug!("write(ino={}, fh={}, offset={}, size={})", u64::from(ino), fh, offset, data.len());
        match self.write_handle(fh, offset, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&self, _req: &Request, ino: INodeNo, fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        let fh = u64::from(fh);
        debug!("flush(ino={}, fh={})", u64::from(ino), fh);
        match self.flush_handle(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fh = u64::from(fh);
        debug!("release(fh={})", fh);
        match self.release_handle(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        debug!("opendir(ino={})", u64::from(ino));
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut context = FileContext::directory();
        if let Err(e) = self
            .fs
            .create_file(&path, AccessMask::GENERIC_READ, CreateMode::Open, &mut context)
        {
            reply.error(errno(&e));
            return;
        }
        let fh = self.handles.alloc(path, context);
        reply.opened(FileHandle(fh), FopenFlags::empty());
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let ino = u64::from(ino);
        debug!("readdir(ino={}, offset={})", ino, offset);
        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        let context = self.context_of(Some(fh));
        let children = match self.fs.find_files_with_pattern(&path, "*", &context) {
            Ok(children) => children,
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        };

        let parent_ino = if ino == ROOT_INO {
            ROOT_INO
        } else {
            self.inodes.ino_for(paths::parent(&path))
        };
        let mut all_entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_ino = self.inodes.ino_for(&paths::join(&path, &child.file_name));
            let kind = if child.is_directory {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            all_entries.push((child_ino, kind, child.file_name));
        }

        for (i, (entry_ino, kind, name)) in all_entries.iter().enumerate().skip(offset as usize) {
            if reply.add(INodeNo(*entry_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        let fh = u64::from(fh);
        debug!("releasedir(fh={})", fh);
        if let Err(e) = self.release_handle(fh) {
            warn!("closing directory handle {} failed: {}", fh, e);
        }
        reply.ok();
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, mode={:#o})", u64::from(parent), name, mode);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let created = self.open_handle(&path, flags, true).and_then(|fh| {
            let attr = self.stat(&path, &self.context_of(Some(FileHandle(fh))))?;
            Ok((fh, attr))
        });
        match created {
            Ok((fh, attr)) => {
                reply.created(&TTL, &attr, Generation(0), FileHandle(fh), FopenFlags::empty())
            }
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:#o})", u64::from(parent), name, mode);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut context = FileContext::directory();
        if let Err(e) = self
            .fs
            .create_file(&path, AccessMask::GENERIC_READ, CreateMode::CreateNew, &mut context)
        {
            reply.error(errno(&e));
            return;
        }
        match self.stat(&path, &context) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", u64::from(parent), name);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut context = FileContext::default();
        if let Err(e) = self.fs.delete_file(&path, &context) {
            reply.error(errno(&e));
            return;
        }
        context.delete_on_close = true;
        if let Err(e) = self.fs.cleanup(&path, &context) {
            reply.error(errno(&e));
            return;
        }
        self.inodes.remove_by_path(&path);
        reply.ok();
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", u64::from(parent), name);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let context = FileContext::directory();
        // The adapter deletes whole subtrees; rmdir(2) must only remove empty ones.
        match self.fs.find_files(&path, &context) {
            Ok(children) if !children.is_empty() => {
                reply.error(raw_errno(libc::ENOTEMPTY));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                reply.error(errno(&e));
                return;
            }
        }
        if let Err(e) = self.fs.delete_directory(&path, &context) {
            reply.error(errno(&e));
            return;
        }
        self.inodes.remove_by_path(&path);
        reply.ok();
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            u64::from(parent),
            name,
            u64::from(newparent),
            newname
        );
        let resolved = self
            .child_path(parent, name)
            .and_then(|old| Ok((old, self.child_path(newparent, newname)?)));
        let (old, new) = match resolved {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        if let Err(e) = self.fs.move_file(&old, &new, true, &FileContext::default()) {
            reply.error(errno(&e));
            return;
        }
        self.inodes.rename(&old, &new);
        self.handles.rename(&old, &new);
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let context = FileContext::default();
        let space = self.fs.get_disk_free_space(&context);
        let volume = self.fs.get_volume_information(&context);
        match space.and_then(|s| Ok((s, volume?))) {
            Ok((space, volume)) => {
                let blocks = |bytes: u64| bytes / BLOCK_SIZE as u64;
                reply.statfs(
                    blocks(space.total_bytes),
                    blocks(space.total_free_bytes),
                    blocks(space.free_bytes_available),
                    0,
                    0,
                    BLOCK_SIZE,
                    volume.max_component_length,
                    BLOCK_SIZE,
                );
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={:?})", u64::from(ino), mask);
        // Permissions are not modelled; any known inode is accessible.
        match self.path_of(ino) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }
}

/// Mounts a [`BucketFs`] through the kernel's FUSE driver.
pub struct FuseDriver;

impl FuseDriver {
    fn config(acl: fuser::SessionACL) -> fuser::Config {
        let mut config = fuser::Config::default();
        config.mount_options = vec![
            fuser::MountOption::FSName(FILE_SYSTEM_NAME.to_string()),
            fuser::MountOption::AutoUnmount,
            fuser::MountOption::DefaultPermissions,
        ];
        config.acl = acl;
        config
    }
}

impl Driver for FuseDriver {
    fn run(
        &self,
        fs: Arc<BucketFs>,
        mountpoint: &Path,
        stop: flume::Receiver<()>,
    ) -> Result<(), MountError> {
        std::fs::create_dir_all(mountpoint)?;

        let config = Self::config(fuser::SessionACL::All);
        let session = match fuser::spawn_mount2(FuseBridge::new(Arc::clone(&fs)), mountpoint, &config) {
            Ok(session) => session,
            Err(e) if e.raw_os_error() == Some(libc::EPERM) || e.to_string().contains("allow_other") => {
                info!("Retrying mount of {} without allow_other...", mountpoint.display());
                let config = Self::config(fuser::SessionACL::Owner);
                fuser::spawn_mount2(FuseBridge::new(fs), mountpoint, &config)?
            }
            Err(e) => return Err(e.into()),
        };
        info!("{} mounted at {}", FILE_SYSTEM_NAME, mountpoint.display());

        // Poll so an external unmount is noticed within 200ms.
        loop {
            match stop.recv_timeout(Duration::from_millis(200)) {
                Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
                Err(flume::RecvTimeoutError::Timeout) => {}
            }
            if session.guard.is_finished() {
                info!("{} was unmounted externally", mountpoint.display());
                session.join()?;
                return Ok(());
            }
        }

        if let Err(e) = session.umount_and_join() {
            warn!("Error during unmount of {}, forcing: {}", mountpoint.display(), e);
            let _ = std::process::Command::new("umount")
                .arg("-f")
                .arg(mountpoint)
                .status();
        }
        Ok(())
    }
}
