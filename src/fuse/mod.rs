pub mod inode;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error, trace, warn};

use crate::error::{Result, StoreError};
use crate::vfs::{FileKind, FileStat, OpenMode, StoreFs};

use self::inode::{child_path, parent_path, HandleTable, InodeTable, ROOT_INODE};

/// Default TTL for attribute caching (1 second)
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// Block size for reporting
const BLOCK_SIZE: u32 = 4096;

fn to_fuse_file_type(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::File => FuseFileType::RegularFile,
        FileKind::Directory => FuseFileType::Directory,
    }
}

fn stat_to_attr(ino: u64, stat: &FileStat) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.size.div_ceil(BLOCK_SIZE as u64),
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.mtime,
        kind: to_fuse_file_type(stat.kind),
        perm: stat.permissions(),
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// FUSE filesystem that delegates to a [`StoreFs`]
pub struct FuseAdapter {
    fs: Arc<StoreFs>,
    inodes: InodeTable,
    handles: HandleTable,
    /// Dedicated runtime for FUSE async operations
    runtime: tokio::runtime::Runtime,
}

impl FuseAdapter {
    pub fn new(fs: Arc<StoreFs>) -> Result<Self> {
        // FUSE callbacks arrive on fuser's own thread; each one blocks on
        // this runtime until its store round trips finish
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()?;

        Ok(Self {
            fs,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            runtime,
        })
    }

    /// Get path for inode, returning ENOENT if not found
    fn inode_to_path(&self, ino: u64) -> std::result::Result<String, i32> {
        self.inodes.get_path(ino).ok_or(libc::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> std::result::Result<String, i32> {
        let parent_path = self.inode_to_path(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(child_path(&parent_path, name))
    }

    fn check_write_capability(&self) -> std::result::Result<(), i32> {
        if self.fs.is_read_only() {
            return Err(libc::EROFS);
        }
        Ok(())
    }

    fn run_async<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }

    /// Stat a path, preferring the size of unsaved writes
    fn attr(&self, ino: u64, path: &str) -> Result<FileAttr> {
        let mut stat = match self.run_async(self.fs.stat(path)) {
            Ok(stat) => stat,
            // Created but not yet flushed
            Err(e) if e.is_not_found() && self.handles.pending_size(ino).is_some() => {
                FileStat::file(0, None, false, self.fs.owner())
            }
            Err(e) => return Err(e),
        };
        if let Some(size) = self.handles.pending_size(ino) {
            stat.size = size;
        }
        Ok(stat_to_attr(ino, &stat))
    }

    fn truncate(&mut self, path: &str, fh: Option<u64>, size: u64) -> Result<()> {
        if let Some(session) = fh.and_then(|fh| self.handles.get_mut(fh)) {
            return session.truncate(size);
        }

        let fs = Arc::clone(&self.fs);
        self.runtime.block_on(async move {
            let mut session = fs.open(path, OpenMode::from_flags(libc::O_RDWR)).await?;
            session.truncate(size)?;
            session.close().await
        })
    }
}

impl Filesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("lookup: {}", path);

        match self.run_async(self.fs.stat(&path)) {
            Ok(stat) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.entry(&ATTR_TTL, &stat_to_attr(ino, &stat), GENERATION);
            }
            Err(StoreError::NotFound(_)) => {
                reply.error(libc::ENOENT);
            }
            Err(e) => {
                error!("lookup error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("getattr: {} (ino={})", path, ino);

        match self.attr(ino, &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => {
                debug!("getattr error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        // Modes are derived from the container ACL
        if mode.is_some() {
            reply.error(libc::ENOSYS);
            return;
        }

        if let Some(new_size) = size {
            if let Err(e) = self.check_write_capability() {
                reply.error(e);
                return;
            }

            trace!("setattr truncate: {} to {} bytes", path, new_size);
            if let Err(e) = self.truncate(&path, fh, new_size) {
                error!("setattr error for {}: {}", path, e);
                reply.error(e.to_errno());
                return;
            }
        }

        match self.attr(ino, &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mode = OpenMode::from_flags(flags);
        trace!("open: {} mode={}", path, mode);

        match self.run_async(self.fs.open(&path, mode)) {
            Ok(session) => {
                let fh = self.handles.insert(ino, session);
                reply.opened(fh, 0);
            }
            Err(e) => {
                debug!("open error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if let Err(e) = self.check_write_capability() {
            reply.error(e);
            return;
        }

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mode = OpenMode::from_flags(flags | libc::O_CREAT);
        debug!("create: {} mode={}", path, mode);

        let fs = Arc::clone(&self.fs);
        let owner = fs.owner();
        let result = self.run_async(async {
            let mut session = fs.open(&path, mode).await?;
            // Save right away so the new name is visible to lookups
            session.flush().await?;
            let stat = session.stat(owner).await?;
            Ok::<_, StoreError>((session, stat))
        });

        match result {
            Ok((session, stat)) => {
                let ino = self.inodes.get_or_create_inode(&path);
                let fh = self.handles.insert(ino, session);
                reply.created(&ATTR_TTL, &stat_to_attr(ino, &stat), GENERATION, fh, 0);
            }
            Err(e) => {
                error!("create error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read: ino={} offset={} size={}", ino, offset, size);

        let session = match self.handles.get_mut(fh) {
            Some(session) => session,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        match session.read_at(offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read error for {}: {}", session.name(), e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if let Err(e) = self.check_write_capability() {
            reply.error(e);
            return;
        }

        trace!("write: ino={} offset={} size={}", ino, offset, data.len());

        let session = match self.handles.get_mut(fh) {
            Some(session) => session,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        match session.write_at(offset.max(0) as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                error!("write error for {}: {}", session.name(), e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        trace!("flush: ino={} fh={}", ino, fh);

        let runtime = &self.runtime;
        let session = match self.handles.get_mut(fh) {
            Some(session) => session,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        match runtime.block_on(session.flush()) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("flush error for {}: {}", session.name(), e);
                reply.error(e.to_errno());
            }
        }
    }

    fn fsync(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        self.flush(req, ino, fh, 0, reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release: ino={} fh={}", ino, fh);

        let mut session = match self.handles.remove(fh) {
            Some(session) => session,
            None => {
                reply.ok();
                return;
            }
        };

        match self.run_async(session.close()) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("close error for {}: {}", session.name(), e);
                reply.error(e.to_errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        if let Err(e) = self.check_write_capability() {
            reply.error(e);
            return;
        }

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        debug!("mkdir: {}", path);

        match self.run_async(self.fs.mkdir(&path)) {
            Ok(true) => {
                let ino = self.inodes.get_or_create_inode(&path);
                let stat = FileStat::directory(None, false, self.fs.owner());
                reply.entry(&ATTR_TTL, &stat_to_attr(ino, &stat), GENERATION);
            }
            Ok(false) => reply.error(libc::EEXIST),
            Err(e) => {
                error!("mkdir error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if let Err(e) = self.check_write_capability() {
            reply.error(e);
            return;
        }

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        debug!("unlink: {}", path);

        match self.run_async(self.fs.unlink(&path)) {
            Ok(true) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Ok(false) => reply.error(libc::ENOENT),
            Err(e) => {
                error!("unlink error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if let Err(e) = self.check_write_capability() {
            reply.error(e);
            return;
        }

        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        debug!("rmdir: {}", path);

        match self.run_async(self.fs.rmdir(&path)) {
            Ok(true) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Ok(false) => reply.error(libc::ENOTEMPTY),
            Err(e) => {
                error!("rmdir error for {}: {}", path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        if let Err(e) = self.check_write_capability() {
            reply.error(e);
            return;
        }

        let (old_path, new_path) = match (self.child(parent, name), self.child(newparent, newname))
        {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };

        debug!("rename: {} -> {}", old_path, new_path);

        match self.run_async(self.fs.rename(&old_path, &new_path)) {
            Ok(()) => {
                self.inodes.rename_path(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => {
                error!("rename error {} -> {}: {}", old_path, new_path, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless - listings are fetched per readdir
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("readdir: {} offset={}", path, offset);

        let entries = match self.run_async(self.fs.list_directory(&path)) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("readdir error for {}: {}", path, e);
                reply.error(e.to_errno());
                return;
            }
        };

        let mut idx = 0i64;

        if offset <= idx && reply.add(ino, idx + 1, FuseFileType::Directory, ".") {
            reply.ok();
            return;
        }
        idx += 1;

        if offset <= idx {
            let parent_ino = if ino == ROOT_INODE {
                ROOT_INODE
            } else {
                self.inodes
                    .get_inode(parent_path(&path))
                    .unwrap_or(ROOT_INODE)
            };
            if reply.add(parent_ino, idx + 1, FuseFileType::Directory, "..") {
                reply.ok();
                return;
            }
        }
        idx += 1;

        for entry in entries {
            if offset <= idx {
                let entry_ino = self
                    .inodes
                    .get_or_create_inode(&child_path(&path, &entry.name));
                let kind = to_fuse_file_type(entry.stat.kind);
                if reply.add(entry_ino, idx + 1, kind, &entry.name) {
                    // Buffer full
                    reply.ok();
                    return;
                }
            }
            idx += 1;
        }

        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.run_async(self.fs.exists(&path)) {
            Ok(true) => reply.ok(),
            Ok(false) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        // The store has no capacity limit to report
        reply.statfs(
            u64::MAX,   // blocks
            u64::MAX,   // bfree
            u64::MAX,   // bavail
            u64::MAX,   // files
            u64::MAX,   // ffree
            BLOCK_SIZE, // bsize
            255,        // namelen
            BLOCK_SIZE, // frsize
        );
    }
}
