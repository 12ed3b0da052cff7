//! Mount management and lifecycle

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuser::MountOption;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{Result, StoreError};
use crate::fuse::FuseAdapter;
use crate::vfs::StoreFs;

/// Filesystem name shown in the mount table
const FS_NAME: &str = "objstore-fs";

/// Represents an active mount
pub struct ActiveMount {
    pub path: PathBuf,
    /// Session handle (for unmounting)
    session: Option<fuser::BackgroundSession>,
}

impl ActiveMount {
    fn new(path: PathBuf, session: fuser::BackgroundSession) -> Self {
        Self {
            path,
            session: Some(session),
        }
    }

    /// Unmount this filesystem
    pub fn unmount(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Unmounting {:?}", self.path);
            drop(session);
        }
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Handles the lifecycle of all mounts
#[derive(Default)]
pub struct MountManager {
    mounts: Mutex<Vec<ActiveMount>>,
}

impl MountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `fs` at `path`.
    ///
    /// A read-only filesystem is also mounted read-only at the FUSE level.
    pub fn mount(&self, path: PathBuf, fs: Arc<StoreFs>) -> Result<()> {
        info!("Mounting at {:?}", path);

        if !path.exists() {
            return Err(StoreError::NotFound(format!(
                "Mount point does not exist: {:?}",
                path
            )));
        }

        if !path.is_dir() {
            return Err(StoreError::InvalidArgument(format!(
                "Mount point is not a directory: {:?}",
                path
            )));
        }

        let mut options = vec![
            MountOption::FSName(FS_NAME.to_string()),
            MountOption::AutoUnmount,
            MountOption::AllowOther,
            MountOption::DefaultPermissions,
        ];

        if fs.is_read_only() {
            info!("Mounting {:?} as read-only", path);
            options.push(MountOption::RO);
        }

        let adapter = FuseAdapter::new(fs)?;
        let session = fuser::spawn_mount2(adapter, &path, &options)?;

        self.mounts.lock().push(ActiveMount::new(path.clone(), session));

        info!("Successfully mounted at {:?}", path);
        Ok(())
    }

    /// Unmount a specific path
    pub fn unmount(&self, path: &Path) -> Result<()> {
        let mut mounts = self.mounts.lock();
        match mounts.iter().position(|m| m.path == path) {
            Some(pos) => {
                mounts.remove(pos).unmount();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("No mount at {:?}", path))),
        }
    }

    /// Unmount all filesystems
    pub fn unmount_all(&self) {
        info!("Unmounting all filesystems");
        let mut mounts = self.mounts.lock();
        for mut mount in mounts.drain(..) {
            mount.unmount();
        }
    }

    /// Active mount paths
    pub fn list_mounts(&self) -> Vec<PathBuf> {
        self.mounts.lock().iter().map(|m| m.path.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.mounts.lock().len()
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        self.unmount_all();
    }
}
