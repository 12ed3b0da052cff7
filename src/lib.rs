//! objstore-fs: object-storage client with a filesystem emulation layer
//!
//! The crate talks to a container/object storage service over its REST
//! protocol and presents the account as a POSIX-like tree that can be
//! mounted through FUSE.
//!
//! # Architecture
//!
//! - **Transport**: one request/response round trip per operation, over
//!   HTTP or against an in-memory store.
//! - **Auth**: token providers and the service catalog naming the storage
//!   endpoint.
//! - **Store**: the resource model. An account ([`store::ObjectStorage`])
//!   holds containers; a container holds objects addressed by flat names.
//! - **VFS**: directory emulation over delimiter listings, file-like
//!   stream sessions over whole objects, and synthesized `stat` results.
//! - **FUSE Adapter** and **Mount Manager**: expose a [`vfs::StoreFs`] at a
//!   host mount point.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use objstore_fs::store::{ObjectStorage, StoreContext};
//! use objstore_fs::transport::MemoryTransport;
//! use objstore_fs::vfs::{OpenMode, StoreFs};
//!
//! # async fn example() -> objstore_fs::Result<()> {
//! let transport = Arc::new(MemoryTransport::new());
//! let storage = ObjectStorage::new(StoreContext::new(
//!     transport.endpoint().to_string(),
//!     "token",
//!     transport,
//! ));
//! let fs = StoreFs::new(storage, None);
//!
//! fs.mkdir("/photos").await?;
//! let mut file = fs.open("/photos/cat.txt", "w".parse()?).await?;
//! file.write(b"meow")?;
//! file.close().await?;
//!
//! let mut file = fs.open("/photos/cat.txt", OpenMode::READ).await?;
//! let mut buf = [0u8; 4];
//! file.read(&mut buf)?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod env;
pub mod error;
pub mod fuse;
pub mod mount;
pub mod store;
pub mod transport;
pub mod vfs;

pub use error::{Result, StoreError};
