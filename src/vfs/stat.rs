//! Stat synthesis
//!
//! The store has no permission bits or owners. Modes are derived from the
//! owning container's ACL (public containers are world-readable) and every
//! entry is owned by the effective user of the process so host permission
//! checks pass.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Regular file in a public container
pub const FILE_PUBLIC: u32 = 0o100775;
/// Regular file in a private container
pub const FILE_PRIVATE: u32 = 0o100770;
/// Directory or container, public
pub const DIR_PUBLIC: u32 = 0o40775;
/// Directory or container, private; also the account root
pub const DIR_PRIVATE: u32 = 0o40770;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Owner reported for every entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// Effective uid/gid of this process
    pub fn current() -> Self {
        Self {
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
        }
    }
}

/// Synthesized `stat` record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileStat {
    /// An object of `size` bytes
    pub fn file(size: u64, modified: Option<DateTime<Utc>>, public: bool, owner: Owner) -> Self {
        let mode = if public { FILE_PUBLIC } else { FILE_PRIVATE };
        Self::build(FileKind::File, size, mode, 1, modified, owner)
    }

    /// A container or synthesized directory
    pub fn directory(modified: Option<DateTime<Utc>>, public: bool, owner: Owner) -> Self {
        let mode = if public { DIR_PUBLIC } else { DIR_PRIVATE };
        Self::build(FileKind::Directory, 0, mode, 2, modified, owner)
    }

    /// The account root
    pub fn root(owner: Owner) -> Self {
        Self::build(FileKind::Directory, 0, DIR_PRIVATE, 2, None, owner)
    }

    fn build(
        kind: FileKind,
        size: u64,
        mode: u32,
        nlink: u32,
        modified: Option<DateTime<Utc>>,
        owner: Owner,
    ) -> Self {
        let time = modified.map(SystemTime::from).unwrap_or(UNIX_EPOCH);
        Self {
            kind,
            size,
            mode,
            uid: owner.uid,
            gid: owner.gid,
            nlink,
            atime: time,
            mtime: time,
            ctime: time,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Permission bits without the file type
    pub fn permissions(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }

    /// Owner may read
    pub fn is_readable(&self) -> bool {
        self.mode & 0o400 != 0
    }

    /// Owner may write
    pub fn is_writable(&self) -> bool {
        self.mode & 0o200 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const OWNER: Owner = Owner { uid: 1000, gid: 100 };

    #[test]
    fn test_file_modes_follow_acl() {
        assert_eq!(FileStat::file(1, None, true, OWNER).mode, 0o100775);
        assert_eq!(FileStat::file(1, None, false, OWNER).mode, 0o100770);
        assert_eq!(FileStat::directory(None, true, OWNER).mode, 0o40775);
        assert_eq!(FileStat::directory(None, false, OWNER).mode, 0o40770);
        assert_eq!(FileStat::root(OWNER).mode, 0o40770);
    }

    #[test]
    fn test_single_instant_fills_all_times() {
        let modified = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let stat = FileStat::file(42, Some(modified), false, OWNER);
        assert_eq!(stat.size, 42);
        assert_eq!(stat.atime, SystemTime::from(modified));
        assert_eq!(stat.atime, stat.mtime);
        assert_eq!(stat.mtime, stat.ctime);
        assert_eq!((stat.uid, stat.gid), (1000, 100));
    }

    #[test]
    fn test_owner_bits() {
        let stat = FileStat::file(0, None, false, OWNER);
        assert!(stat.is_readable());
        assert!(stat.is_writable());
        assert!(!stat.is_dir());
        assert_eq!(stat.permissions(), 0o770);
        assert!(FileStat::root(OWNER).is_dir());
    }

    #[test]
    fn test_current_owner_is_effective_user() {
        let owner = Owner::current();
        assert_eq!(owner.uid, unsafe { libc::geteuid() });
    }
}
