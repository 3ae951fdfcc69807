//! Storage-object files
//!
//! The file interface the storage layer consumes, and the two
//! implementations behind it:
//!
//! ```text
//!                      Oss::new_file()
//!                            │
//!          enabled ──────────┴────────── disabled
//!             │                              │
//!             ▼                              │
//!   ┌───────────────────┐                    │
//!   │   BufferedFile    │ staging buffer,    │
//!   │                   │ adapter, stats     │
//!   └─────────┬─────────┘                    │
//!             │ open/close/pass-through      │
//!             ▼                              ▼
//!   ┌──────────────────────────────────────────────┐
//!   │                  DirectFile                  │
//!   │     straight to the ObjectStore; readv via   │
//!   │     ExtentCoalescer                          │
//!   └──────────────────────────────────────────────┘
//! ```

pub mod buffered;
pub mod direct;

pub use buffered::{BufferedFile, FileSummary};
pub use direct::DirectFile;

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::aio::{AioRead, AioWrite};
use crate::config::BufferConfig;
use crate::error::Result;
use crate::store::{FileStat, Fd, ObjectStore, OpenFlags};

/// One element of a vectored read: fill `buf` from file offset `offset`.
#[derive(Debug)]
pub struct IoVec<'a> {
    pub offset: u64,
    pub buf: &'a mut [u8],
}

impl<'a> IoVec<'a> {
    pub fn new(offset: u64, buf: &'a mut [u8]) -> Self {
        Self { offset, buf }
    }
}

/// File interface over a storage object.
///
/// Every operation other than `open` fails with `Error::NotOpen` on a file
/// that isn't open.
pub trait OssFile: Send + Sync {
    /// Open `path`, returning the store descriptor.
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd>;

    /// Close the file. The file may be reopened afterwards.
    fn close(&mut self) -> Result<()>;

    /// Descriptor while open.
    fn fd(&self) -> Option<Fd>;

    /// Read into `buf` at `offset`; returns bytes read.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` at `offset`; returns bytes accepted.
    fn write(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Start an asynchronous read.
    fn read_aio(&self, req: AioRead) -> Result<()>;

    /// Start an asynchronous write.
    fn write_aio(&self, req: AioWrite) -> Result<()>;

    /// Read that bypasses any caching layer.
    fn read_raw(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Vectored read; returns total bytes delivered.
    fn readv(&self, iov: &mut [IoVec<'_>]) -> Result<usize>;

    fn fstat(&self) -> Result<FileStat>;

    fn fsync(&self) -> Result<()>;

    fn ftruncate(&self, len: u64) -> Result<()>;

    /// Statistics of the current (or last closed) session, if kept.
    fn summary(&self) -> Option<FileSummary> {
        None
    }
}

/// Storage-system front: hands out files and serves path-level calls.
pub struct Oss {
    store: Arc<dyn ObjectStore>,
    config: BufferConfig,
}

impl std::fmt::Debug for Oss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oss")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Oss {
    /// Validates `config`.
    pub fn new(store: Arc<dyn ObjectStore>, config: BufferConfig) -> Result<Self> {
        config.validate()?;
        debug!(
            store = store.name(),
            buffered = config.enabled,
            buffer_size = config.buffer_size,
            adapter = %config.adapter,
            "storage front ready"
        );
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// A new, unopened file; buffered when the configuration enables it.
    pub fn new_file(&self) -> Box<dyn OssFile> {
        let direct = DirectFile::new(Arc::clone(&self.store), self.config.readv);
        if self.config.enabled {
            Box::new(BufferedFile::new(
                Box::new(direct),
                Arc::clone(&self.store),
                self.config.clone(),
            ))
        } else {
            Box::new(direct)
        }
    }

    #[instrument(skip(self))]
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        self.store.stat(path)
    }

    #[instrument(skip(self))]
    pub fn truncate(&self, path: &str, len: u64) -> Result<()> {
        self.store.truncate(path, len)
    }

    #[instrument(skip(self))]
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.store.unlink(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterKind;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    fn oss(enabled: bool) -> (MemoryStore, Oss) {
        let store = MemoryStore::new();
        let config = BufferConfig {
            enabled,
            buffer_size: 64,
            adapter: AdapterKind::Sync,
            ..Default::default()
        };
        let oss = Oss::new(Arc::new(store.clone()), config).unwrap();
        (store, oss)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = BufferConfig {
            buffer_size: 0,
            ..Default::default()
        };
        assert!(Oss::new(Arc::new(MemoryStore::new()), config).is_err());
    }

    #[test]
    fn test_buffered_file_keeps_summary() {
        let (store, oss) = oss(true);
        let mut file = oss.new_file();
        file.open("/a", OpenFlags::create_truncate()).unwrap();
        file.write(b"abc", 0).unwrap();
        assert_eq!(store.counts().pwrites, 0);
        file.close().unwrap();

        assert_eq!(store.object("/a").unwrap(), b"abc".to_vec());
        assert_eq!(file.summary().unwrap().write_bytes, 3);
    }

    #[test]
    fn test_direct_file_writes_through() {
        let (store, oss) = oss(false);
        let mut file = oss.new_file();
        file.open("/a", OpenFlags::create_truncate()).unwrap();
        file.write(b"abc", 0).unwrap();
        assert_eq!(store.counts().pwrites, 1);
        file.close().unwrap();
        assert!(file.summary().is_none());
    }

    #[test]
    fn test_path_calls() {
        let (store, oss) = oss(true);
        store.insert("/p", vec![7u8; 20]);
        assert_eq!(oss.stat("/p").unwrap().size, 20);
        oss.truncate("/p", 5).unwrap();
        assert_eq!(store.object("/p").unwrap().len(), 5);
        oss.unlink("/p").unwrap();
        assert_matches!(oss.stat("/p"), Err(Error::NotFound(_)));
    }
}
