//! Object-store transport collaborators
//!
//! The buffering core never talks to a storage backend directly. Everything
//! it needs from the remote store goes through the [`ObjectStore`] trait:
//! positioned reads and writes against a file descriptor, asynchronous
//! submission with a completion callback, and the handful of metadata calls
//! the pass-through file operations forward.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │          BufferedFile / DirectFile (oss module)           │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │  ObjectStore trait
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!     ┌─────────────────┐             ┌─────────────────┐
//!     │   MemoryStore   │             │   PosixStore    │
//!     │ (tests, faults) │             │ (local files,   │
//!     │                 │             │  tokio AIO)     │
//!     └─────────────────┘             └─────────────────┘
//! ```
//!
//! # Completion contract
//!
//! `submit_read` / `submit_write` either return `Err` immediately (and never
//! invoke the completion) or return `Ok(())` and invoke the completion exactly
//! once, later, from a thread owned by the store.

pub mod memory;
pub mod posix;

pub use memory::{AioMode, MemoryStore, StoreCallCounts, WriteRecord};
pub use posix::PosixStore;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One past the last byte of `len` bytes at `offset`.
///
/// Ranges reaching past `u64::MAX` are rejected as invalid arguments.
pub fn checked_end(offset: u64, len: usize) -> Result<u64> {
    offset.checked_add(len as u64).ok_or_else(|| {
        Error::InvalidArgument(format!("{len} bytes at offset {offset} overflow the file offset"))
    })
}

/// Completion for an asynchronous read: the bytes read, or the failure.
pub type ReadCompletion = Box<dyn FnOnce(Result<Bytes>) + Send + 'static>;

/// Completion for an asynchronous write: the bytes written, or the failure.
pub type WriteCompletion = Box<dyn FnOnce(Result<usize>) + Send + 'static>;

/// File descriptor handed out by an [`ObjectStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fd(pub i32);

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of transport operation, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoType {
    Open,
    Close,
    Read,
    Write,
    Submit,
    Sync,
    Truncate,
    Stat,
    Unlink,
}

impl std::fmt::Display for IoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoType::Open => write!(f, "open"),
            IoType::Close => write!(f, "close"),
            IoType::Read => write!(f, "read"),
            IoType::Write => write!(f, "write"),
            IoType::Submit => write!(f, "aio-submit"),
            IoType::Sync => write!(f, "fsync"),
            IoType::Truncate => write!(f, "truncate"),
            IoType::Stat => write!(f, "stat"),
            IoType::Unlink => write!(f, "unlink"),
        }
    }
}

/// Flags for opening an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create the object if it doesn't exist.
    pub create: bool,
    /// Truncate the object to zero length on open.
    pub truncate: bool,
}

impl OpenFlags {
    /// Flags for reading an existing object.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Flags for read/write access to an existing object.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Flags for creating (or truncating) an object for writing.
    pub fn create_truncate() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate: true,
        }
    }

    /// Whether the object was opened with write access.
    pub fn is_write(&self) -> bool {
        self.write
    }
}

/// Metadata returned by `fstat` / `stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    /// Object size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// Transport-level access to a storage backend.
///
/// Implementations must be safe to call from several threads at once; the
/// buffering layer serialises access per file descriptor, not per store.
pub trait ObjectStore: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Opens an object and returns its descriptor.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd>;

    /// Closes a descriptor.
    fn close(&self, fd: Fd) -> Result<()>;

    /// Positioned read into `buf`. Returns the bytes read (0 at end of object).
    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Positioned write of `buf`. Returns the bytes written.
    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64) -> Result<usize>;

    /// Submits an asynchronous read of up to `len` bytes at `offset`.
    fn submit_read(&self, fd: Fd, offset: u64, len: usize, done: ReadCompletion) -> Result<()>;

    /// Submits an asynchronous write of `data` at `offset`.
    fn submit_write(&self, fd: Fd, offset: u64, data: Bytes, done: WriteCompletion)
        -> Result<()>;

    /// Metadata of an open descriptor.
    fn fstat(&self, fd: Fd) -> Result<FileStat>;

    /// Flushes the object to durable storage.
    fn fsync(&self, fd: Fd) -> Result<()>;

    /// Truncates (or extends) an open object.
    fn ftruncate(&self, fd: Fd, len: u64) -> Result<()>;

    /// Metadata of an object by path.
    fn stat(&self, path: &str) -> Result<FileStat>;

    /// Truncates an object by path.
    fn truncate(&self, path: &str, len: u64) -> Result<()>;

    /// Removes an object.
    fn unlink(&self, path: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        assert!(!OpenFlags::read_only().is_write());
        assert!(OpenFlags::read_write().is_write());

        let flags = OpenFlags::create_truncate();
        assert!(flags.is_write());
        assert!(flags.create);
        assert!(flags.truncate);
    }

    #[test]
    fn test_io_type_display() {
        assert_eq!(IoType::Read.to_string(), "read");
        assert_eq!(IoType::Submit.to_string(), "aio-submit");
        assert_eq!(Fd(12).to_string(), "12");
    }
}
