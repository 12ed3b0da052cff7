//! Stream sessions
//!
//! The store cannot write part of an object. A session therefore loads the
//! whole body into a local buffer on open, serves reads, writes and seeks
//! from that buffer, and writes the whole buffer back on flush and close
//! when it changed.
//!
//! Two sessions on the same name do not see each other; whichever flushes
//! last wins.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::mode::OpenMode;
use super::stat::{FileStat, Owner};
use crate::error::{Result, StoreError};
use crate::store::{Container, Object, MAX_OBJECT_SIZE};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Flushing,
}

impl SessionState {
    fn for_mode(mode: OpenMode) -> Self {
        match (mode.read, mode.write) {
            (true, true) => SessionState::ReadWrite,
            (false, true) => SessionState::WriteOnly,
            _ => SessionState::ReadOnly,
        }
    }
}

/// Behaviour shared by every session of a filesystem
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Drop writes instead of saving them
    pub never_write: bool,
    /// Content type of objects created through a session
    pub content_type: Option<String>,
}

/// An open object
#[derive(Debug)]
pub struct StreamSession {
    container: Container,
    name: String,
    mode: OpenMode,
    state: SessionState,
    buffer: Cursor<Vec<u8>>,
    dirty: bool,
    object: Option<Object>,
    last_modified: Option<DateTime<Utc>>,
    options: SessionOptions,
}

impl StreamSession {
    /// Open `name` in `container`.
    ///
    /// An existing object is loaded unless the mode truncates it or must
    /// create it exclusively, in which case only its attributes are
    /// fetched. A missing object is created empty when the mode allows it.
    pub async fn open(
        container: Container,
        name: &str,
        mode: OpenMode,
        options: SessionOptions,
    ) -> Result<Self> {
        let mut session = Self {
            container,
            name: name.to_string(),
            mode,
            state: SessionState::Opening,
            buffer: Cursor::new(Vec::new()),
            dirty: false,
            object: None,
            last_modified: None,
            options,
        };

        let fetched = if mode.needs_content() {
            session.container.object(name).await
        } else {
            session.container.proxy_object(name).await
        };

        match fetched {
            Ok(_) if mode.exclusive => {
                return Err(StoreError::AlreadyExists(format!(
                    "{}/{}",
                    session.container.name(),
                    name
                )));
            }
            Ok(remote) => {
                session.last_modified = remote.last_modified();
                let mut object = remote.into_object();
                let content = object.take_content();

                if mode.truncate {
                    session.dirty = true;
                } else if let Some(content) = content {
                    session.buffer = Cursor::new(content.to_vec());
                }
                if mode.append {
                    session.buffer.seek(SeekFrom::End(0))?;
                }
                session.object = Some(object);
            }
            Err(e) if e.is_not_found() && mode.create => {
                let mut object = Object::new(name);
                if let Some(content_type) = &session.options.content_type {
                    object.set_content_type(content_type.clone());
                }
                session.object = Some(object);
                session.dirty = true;
            }
            Err(e) => return Err(e),
        }

        session.state = SessionState::for_mode(mode);
        debug!(
            "open: {}/{} mode={} size={}",
            session.container.name(),
            name,
            mode,
            session.len()
        );
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the buffer differs from what was last saved
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Buffer length
    pub fn len(&self) -> u64 {
        self.buffer.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.get_ref().is_empty()
    }

    pub fn position(&self) -> u64 {
        self.buffer.position()
    }

    fn ensure_readable(&self) -> Result<()> {
        match self.state {
            SessionState::ReadOnly | SessionState::ReadWrite => Ok(()),
            state => Err(StoreError::BadDescriptor(format!(
                "{} is not open for reading ({:?})",
                self.name, state
            ))),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.state {
            SessionState::WriteOnly | SessionState::ReadWrite => Ok(()),
            state => Err(StoreError::BadDescriptor(format!(
                "{} is not open for writing ({:?})",
                self.name, state
            ))),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Closed | SessionState::Opening => Err(StoreError::BadDescriptor(
                format!("{} is not open", self.name),
            )),
            _ => Ok(()),
        }
    }

    /// Read from the current position; 0 at end of buffer
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_readable()?;
        let n = self.buffer.read(buf)?;
        trace!("read: {} {} bytes at {}", self.name, n, self.position());
        Ok(n)
    }

    /// Read up to `size` bytes at `offset` without moving the position
    pub fn read_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.ensure_readable()?;
        let data = self.buffer.get_ref();
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Grow the buffer's capacity to hold `len` bytes.
    ///
    /// Lengths past [`MAX_OBJECT_SIZE`] or beyond what can be allocated are
    /// refused; the buffer is left untouched.
    fn reserve(&mut self, len: Option<u64>) -> Result<usize> {
        let len = len
            .filter(|len| *len <= MAX_OBJECT_SIZE)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| {
                StoreError::FileTooLarge(format!(
                    "{} cannot exceed {} bytes",
                    self.name, MAX_OBJECT_SIZE
                ))
            })?;

        let buffer = self.buffer.get_mut();
        buffer
            .try_reserve(len.saturating_sub(buffer.len()))
            .map_err(|e| StoreError::FileTooLarge(format!("{}: {}", self.name, e)))?;
        Ok(len)
    }

    /// Write at the current position, growing the buffer as needed
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        self.reserve(self.position().checked_add(data.len() as u64))?;
        let n = self.buffer.write(data)?;
        self.dirty = true;
        trace!("write: {} {} bytes, now at {}", self.name, n, self.position());
        Ok(n)
    }

    /// Write at `offset`, leaving the position after the written bytes
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        self.reserve(offset.checked_add(data.len() as u64))?;
        self.buffer.seek(SeekFrom::Start(offset))?;
        self.write(data)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.buffer.seek(pos)?)
    }

    /// Resize the buffer; the position is left where it was
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        let size = self.reserve(Some(size))?;
        self.buffer.get_mut().resize(size, 0);
        self.dirty = true;
        Ok(())
    }

    /// Write the buffer back if it changed
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;

        if self.options.never_write {
            trace!("flush: {} skipped (never_write)", self.name);
            return Ok(());
        }
        if !self.dirty {
            return Ok(());
        }

        let object = match self.object.as_mut() {
            Some(object) => object,
            None => {
                return Err(StoreError::BadDescriptor(format!(
                    "{} has no object",
                    self.name
                )))
            }
        };

        let previous = self.state;
        self.state = SessionState::Flushing;
        object.set_content(Bytes::copy_from_slice(self.buffer.get_ref()));
        let saved = self.container.save(object).await;
        object.take_content();
        self.state = previous;
        saved?;

        self.dirty = false;
        self.last_modified = Some(Utc::now());
        debug!(
            "flush: {}/{} ({} bytes)",
            self.container.name(),
            self.name,
            self.len()
        );
        Ok(())
    }

    /// Flush and release the buffer; the session is unusable afterwards
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let flushed = self.flush().await;

        self.state = SessionState::Closed;
        self.buffer = Cursor::new(Vec::new());
        self.object = None;
        flushed
    }

    /// Attributes of the open object as the buffer currently stands
    pub async fn stat(&self, owner: Owner) -> Result<FileStat> {
        self.ensure_open()?;
        let public = self.container.acl().await?.is_public();
        Ok(FileStat::file(self.len(), self.last_modified, public, owner))
    }
}
