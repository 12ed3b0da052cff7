//! Directory emulation
//!
//! Directories do not exist in the store. A directory is the set of names
//! sharing a `/`-terminated prefix: a delimiter listing of that prefix
//! yields its files as objects and its subdirectories as subdirs.

use futures::TryStreamExt;
use tracing::trace;

use crate::error::Result;
use crate::store::{Container, ListingEntry, RemoteObject, Subdir};

/// Delimiter separating path components in object names
pub const DELIMITER: char = '/';

/// Immediate children of a directory
#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    pub directories: Vec<Subdir>,
    pub files: Vec<RemoteObject>,
}

impl DirectoryListing {
    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.directories.len() + self.files.len()
    }
}

/// Listing prefix for a directory path: empty for the container itself,
/// otherwise the path with a trailing delimiter
pub fn directory_prefix(path: &str) -> String {
    let path = path.trim_matches(DELIMITER);
    if path.is_empty() {
        String::new()
    } else {
        format!("{}{}", path, DELIMITER)
    }
}

/// Name of a child relative to its directory prefix
pub fn child_name<'a>(prefix: &str, full: &'a str) -> &'a str {
    full.strip_prefix(prefix)
        .unwrap_or(full)
        .trim_end_matches(DELIMITER)
}

/// List the children of `path`, following markers across pages.
///
/// A placeholder object named exactly like the prefix is not a child.
pub async fn list_directory(container: &Container, path: &str) -> Result<DirectoryListing> {
    let prefix = directory_prefix(path);
    trace!("list_directory: {}/{}", container.name(), prefix);

    let mut listing = DirectoryListing::default();
    let mut entries = container.list_all(&prefix, Some(DELIMITER))?;
    while let Some(entry) = entries.try_next().await? {
        match entry {
            ListingEntry::Subdir(subdir) => listing.directories.push(subdir),
            ListingEntry::Object(object) if object.name() == prefix => {}
            ListingEntry::Object(object) => listing.files.push(object),
        }
    }
    Ok(listing)
}

/// A directory exists iff at least one name lives under its prefix
pub async fn directory_exists(container: &Container, path: &str) -> Result<bool> {
    let prefix = directory_prefix(path);
    let first = container
        .objects_with_prefix(&prefix, Some(DELIMITER), Some(1), None)
        .await?;
    Ok(!first.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Object, ObjectStorage, StoreContext};
    use crate::transport::MemoryTransport;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    async fn container_with(names: &[&str]) -> Container {
        let transport = Arc::new(MemoryTransport::new());
        let storage = ObjectStorage::new(StoreContext::new(
            transport.endpoint().to_string(),
            "tk",
            transport.clone(),
        ));
        storage
            .create_container("c", None, &BTreeMap::new())
            .await
            .unwrap();
        let container = storage.container_handle("c");
        for name in names {
            container
                .save(&Object::with_content(*name, "x", "text/plain"))
                .await
                .unwrap();
        }
        container
    }

    #[test]
    fn test_prefix_helpers() {
        assert_eq!(directory_prefix(""), "");
        assert_eq!(directory_prefix("/"), "");
        assert_eq!(directory_prefix("a"), "a/");
        assert_eq!(directory_prefix("a/b/"), "a/b/");
        assert_eq!(child_name("a/", "a/c/"), "c");
        assert_eq!(child_name("a/", "a/b.txt"), "b.txt");
    }

    #[tokio::test]
    async fn test_partition_files_and_directories() {
        let container = container_with(&["a/b.txt", "a/c/d.txt"]).await;

        let listing = list_directory(&container, "a").await.unwrap();
        let files: Vec<&str> = listing.files.iter().map(|o| o.name()).collect();
        let dirs: Vec<&str> = listing.directories.iter().map(|d| d.path()).collect();
        assert_eq!(files, vec!["a/b.txt"]);
        assert_eq!(dirs, vec!["a/c/"]);

        let root = list_directory(&container, "").await.unwrap();
        assert!(root.files.is_empty());
        assert_eq!(root.directories.len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_object_is_skipped() {
        let container = container_with(&["a/", "a/b.txt"]).await;
        let listing = list_directory(&container, "a/").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing.files[0].name(), "a/b.txt");
    }

    #[tokio::test]
    async fn test_directory_exists() {
        let container = container_with(&["a/c/d.txt"]).await;
        assert!(directory_exists(&container, "a").await.unwrap());
        assert!(directory_exists(&container, "a/c").await.unwrap());
        assert!(!directory_exists(&container, "b").await.unwrap());
        assert!(!directory_exists(&container, "a/c/d.txt").await.unwrap());
    }
}
