//! Inode and file-handle tables
//!
//! The kernel addresses entries by inode number while [`StoreFs`] works on
//! host paths. Inodes are handed out on first sight of a path and follow
//! renames; file handles map to open [`StreamSession`]s.
//!
//! [`StoreFs`]: crate::vfs::StoreFs

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::vfs::StreamSession;

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode <-> host path mapping
pub struct InodeTable {
    inode_to_path: DashMap<u64, String>,
    path_to_inode: DashMap<String, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Create a table with the root registered
    pub fn new() -> Self {
        let table = Self {
            inode_to_path: DashMap::new(),
            path_to_inode: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        table.inode_to_path.insert(ROOT_INODE, "/".to_string());
        table.path_to_inode.insert("/".to_string(), ROOT_INODE);
        table
    }

    /// Inode of `path`, allocating one on first sight
    pub fn get_or_create_inode(&self, path: &str) -> u64 {
        let normalized = normalize_path(path);
        *self
            .path_to_inode
            .entry(normalized.clone())
            .or_insert_with(|| {
                let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
                self.inode_to_path.insert(inode, normalized);
                inode
            })
    }

    pub fn get_path(&self, inode: u64) -> Option<String> {
        self.inode_to_path.get(&inode).map(|p| p.clone())
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(&normalize_path(path)).map(|i| *i)
    }

    /// Forget `path`
    pub fn remove_path(&self, path: &str) {
        if let Some((_, inode)) = self.path_to_inode.remove(&normalize_path(path)) {
            self.inode_to_path.remove(&inode);
        }
    }

    /// Move the inode of `old` to `new`; an inode previously at `new` is
    /// forgotten
    pub fn rename_path(&self, old: &str, new: &str) {
        let new = normalize_path(new);
        if let Some((_, inode)) = self.path_to_inode.remove(&normalize_path(old)) {
            if let Some(replaced) = self.path_to_inode.insert(new.clone(), inode) {
                self.inode_to_path.remove(&replaced);
            }
            self.inode_to_path.insert(inode, new);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a directory path and a child name
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Parent directory of a host path
pub fn parent_path(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Open sessions keyed by file handle
#[derive(Default)]
pub struct HandleTable {
    sessions: HashMap<u64, (u64, StreamSession)>,
    next_handle: u64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session opened on `inode` and return its handle
    pub fn insert(&mut self, inode: u64, session: StreamSession) -> u64 {
        self.next_handle += 1;
        self.sessions.insert(self.next_handle, (inode, session));
        self.next_handle
    }

    pub fn get_mut(&mut self, handle: u64) -> Option<&mut StreamSession> {
        self.sessions.get_mut(&handle).map(|(_, session)| session)
    }

    pub fn remove(&mut self, handle: u64) -> Option<StreamSession> {
        self.sessions.remove(&handle).map(|(_, session)| session)
    }

    /// Buffer length of an open session on `inode` with unsaved changes
    pub fn pending_size(&self, inode: u64) -> Option<u64> {
        self.sessions
            .values()
            .find(|(ino, session)| *ino == inode && session.is_dirty())
            .map(|(_, session)| session.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode() {
        let table = InodeTable::new();
        assert_eq!(table.get_inode("/"), Some(ROOT_INODE));
        assert_eq!(table.get_path(ROOT_INODE).as_deref(), Some("/"));
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let table = InodeTable::new();
        let first = table.get_or_create_inode("/c/a.txt");
        let second = table.get_or_create_inode("/c/a.txt/");
        assert_eq!(first, second);
        assert_ne!(first, ROOT_INODE);
        assert_eq!(table.get_path(first).as_deref(), Some("/c/a.txt"));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_and_rename() {
        let table = InodeTable::new();
        let inode = table.get_or_create_inode("/c/a");
        let replaced = table.get_or_create_inode("/c/b");

        table.rename_path("/c/a", "/c/b");
        assert_eq!(table.get_inode("/c/b"), Some(inode));
        assert!(table.get_inode("/c/a").is_none());
        assert!(table.get_path(replaced).is_none());

        table.remove_path("/c/b");
        assert!(table.get_path(inode).is_none());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(child_path("/", "c"), "/c");
        assert_eq!(child_path("/c", "a.txt"), "/c/a.txt");
        assert_eq!(parent_path("/c/a.txt"), "/c");
        assert_eq!(parent_path("/c"), "/");
        assert_eq!(parent_path("/"), "/");
    }
}
