//! Filesystem emulation over the object store
//!
//! [`StoreFs`] is the host-facing facade: it resolves host paths into
//! containers and object names and implements the POSIX-like operations on
//! top of the resource model.
//!
//! - files are objects, opened as [`StreamSession`]s
//! - directories are name prefixes (see [`directory`])
//! - rename is a server-side copy followed by a delete
//! - modes and owners are synthesized (see [`stat`])

pub mod directory;
pub mod mode;
pub mod path;
pub mod session;
pub mod stat;

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::error::{Result, StoreError};
use crate::store::{Container, ObjectStorage};

pub use directory::{DirectoryListing, DELIMITER};
pub use mode::OpenMode;
pub use path::{Location, PathResolver};
pub use session::{SessionOptions, SessionState, StreamSession};
pub use stat::{FileKind, FileStat, Owner};

/// Containers requested per page when listing the account
const CONTAINER_PAGE_SIZE: usize = 1000;

/// A named child of a directory
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// The object store seen as a filesystem
#[derive(Debug)]
pub struct StoreFs {
    storage: ObjectStorage,
    resolver: PathResolver,
    options: SessionOptions,
    owner: Owner,
    read_only: bool,
}

impl StoreFs {
    pub fn new(storage: ObjectStorage, root_container: Option<String>) -> Self {
        Self {
            storage,
            resolver: PathResolver::new(root_container),
            options: SessionOptions::default(),
            owner: Owner::current(),
            read_only: false,
        }
    }

    pub fn with_session_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Reject every operation that would change the store
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_owner(mut self, owner: Owner) -> Self {
        self.owner = owner;
        self
    }

    pub fn storage(&self) -> &ObjectStorage {
        &self.storage
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn resolve(&self, path: &str) -> Location {
        self.resolver.resolve(path)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Split a path into its container and object name; paths that do not
    /// name an object are configuration errors
    fn object_location(&self, path: &str) -> Result<(Container, String)> {
        match self.resolve(path) {
            Location::Object { container, name } => {
                Ok((self.storage.container_handle(&container), name))
            }
            Location::Container(container) => Err(StoreError::Configuration(format!(
                "Path {} names container {} but no object",
                path, container
            ))),
            Location::Root => Err(StoreError::Configuration(format!(
                "Path {} names no container",
                path
            ))),
        }
    }

    async fn is_public(&self, container: &Container) -> Result<bool> {
        Ok(container.acl().await?.is_public())
    }

    /// Open a file
    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<StreamSession> {
        if mode.write {
            self.check_writable()?;
        }
        let (container, name) = self.object_location(path)?;
        StreamSession::open(container, &name, mode, self.options.clone()).await
    }

    /// Attributes of a path: the account root, a container, an object or a
    /// pseudo-directory
    pub async fn stat(&self, path: &str) -> Result<FileStat> {
        trace!("stat: {}", path);
        match self.resolve(path) {
            Location::Root => Ok(FileStat::root(self.owner)),
            Location::Container(name) => {
                let container = self.storage.container(&name).await?;
                Ok(FileStat::directory(
                    None,
                    self.is_public(&container).await?,
                    self.owner,
                ))
            }
            Location::Object { container, name } => {
                let container = self.storage.container_handle(&container);
                match container.proxy_object(&name).await {
                    Ok(object) => Ok(FileStat::file(
                        object.content_length(),
                        object.last_modified(),
                        self.is_public(&container).await?,
                        self.owner,
                    )),
                    Err(e) if e.is_not_found() => {
                        if directory::directory_exists(&container, &name).await? {
                            Ok(FileStat::directory(
                                None,
                                self.is_public(&container).await?,
                                self.owner,
                            ))
                        } else {
                            Err(e)
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Whether a path names anything; lookup failures other than absence
    /// are reported
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Children of a directory with their attributes
    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        trace!("list_directory: {}", path);
        match self.resolve(path) {
            Location::Root => self.list_containers().await,
            Location::Container(name) => {
                let container = self.storage.container(&name).await?;
                self.list_prefix(&container, "").await
            }
            Location::Object { container, name } => {
                let container = self.storage.container_handle(&container);
                self.list_prefix(&container, &name).await
            }
        }
    }

    async fn list_containers(&self) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .storage
                .containers(Some(CONTAINER_PAGE_SIZE), marker.as_deref())
                .await?;
            let exhausted = page.len() < CONTAINER_PAGE_SIZE;
            marker = page.last().map(|c| c.name().to_string());

            for container in page {
                let public = self.is_public(&container).await?;
                entries.push(DirEntry {
                    name: container.name().to_string(),
                    stat: FileStat::directory(None, public, self.owner),
                });
            }

            if exhausted || marker.is_none() {
                break;
            }
        }
        Ok(entries)
    }

    async fn list_prefix(&self, container: &Container, path: &str) -> Result<Vec<DirEntry>> {
        let prefix = directory::directory_prefix(path);
        let listing = directory::list_directory(container, path).await?;
        let public = self.is_public(container).await?;

        let directories = listing.directories.iter().map(|subdir| DirEntry {
            name: directory::child_name(&prefix, subdir.path()).to_string(),
            stat: FileStat::directory(None, public, self.owner),
        });
        let files = listing.files.iter().map(|object| DirEntry {
            name: directory::child_name(&prefix, object.name()).to_string(),
            stat: FileStat::file(
                object.content_length(),
                object.last_modified(),
                public,
                self.owner,
            ),
        });

        let mut entries: Vec<DirEntry> = directories.chain(files).collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Move an object: server-side copy to the new name, possibly in
    /// another container, then delete the original
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.check_writable()?;
        let (source, from_name) = self.object_location(from)?;
        let (target, to_name) = self.object_location(to)?;

        if source.name() == target.name() && from_name == to_name {
            return Ok(());
        }

        let object = source.proxy_object(&from_name).await?;
        source
            .copy(object.object(), &to_name, Some(target.name()))
            .await?;
        source.delete(&from_name).await?;

        debug!(
            "rename: {}/{} -> {}/{}",
            source.name(),
            from_name,
            target.name(),
            to_name
        );
        Ok(())
    }

    /// Delete a file; false if it did not exist
    pub async fn unlink(&self, path: &str) -> Result<bool> {
        self.check_writable()?;
        let (container, name) = self.object_location(path)?;
        container.delete(&name).await
    }

    /// Create a directory.
    ///
    /// At the top level this creates a container. Below it nothing is
    /// stored: the directory appears once something is written under it,
    /// and the call only fails when a file already has the name. The
    /// container must exist.
    pub async fn mkdir(&self, path: &str) -> Result<bool> {
        self.check_writable()?;
        match self.resolve(path) {
            Location::Root => Ok(false),
            Location::Container(name) => {
                self.storage
                    .create_container(&name, None, &BTreeMap::new())
                    .await
            }
            Location::Object { container, name } => {
                let container = self.storage.container(&container).await?;
                match container.proxy_object(&name).await {
                    Ok(_) => Ok(false),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Remove an empty directory.
    ///
    /// At the top level this deletes the container, reporting false when it
    /// still holds objects. Below it there is nothing to delete: the call
    /// succeeds iff nothing lives under the prefix.
    pub async fn rmdir(&self, path: &str) -> Result<bool> {
        self.check_writable()?;
        match self.resolve(path) {
            Location::Root => Ok(false),
            Location::Container(name) => match self.storage.delete_container(&name).await {
                Ok(deleted) => Ok(deleted),
                Err(StoreError::Conflict(_)) => Ok(false),
                Err(e) => Err(e),
            },
            Location::Object { container, name } => {
                let container = self.storage.container(&container).await?;
                Ok(!directory::directory_exists(&container, &name).await?)
            }
        }
    }
}
