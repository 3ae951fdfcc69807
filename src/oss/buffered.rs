//! Buffered storage-object file
//!
//! Wraps a raw [`OssFile`] and routes `read`, `write`, `read_aio` and
//! `write_aio` through a [`BufferAlgorithm`]. Everything else passes straight
//! through to the raw file.
//!
//! # Lifecycle
//!
//! - `open` opens the raw file first and builds the buffer, adapter and
//!   algorithm only once that has succeeded.
//! - `close` waits for outstanding AIO, flushes staged writes if the file
//!   was opened for writing, closes the raw file and logs a summary. A flush
//!   failure still closes the raw file and is returned as
//!   `Error::FlushOnClose`.
//! - Dropping a file that is still open closes it the same way, logging any
//!   failure.
//!
//! A file opened without write access refuses `write` and `write_aio` with
//! `-EBADF`, as the raw file would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{IoVec, OssFile};
use crate::aio::{AioRead, AioWrite};
use crate::buffer::{
    build_algorithm, AdapterStatsSnapshot, BufferAlgorithm, CacheState, CacheStatsSnapshot,
};
use crate::config::{AdapterKind, BufferConfig};
use crate::error::{Error, Result};
use crate::store::{FileStat, Fd, IoType, ObjectStore, OpenFlags};

// =============================================================================
// Statistics
// =============================================================================

/// Bytes moved through the synchronous entry points of one open session.
///
/// Asynchronous bytes are counted by the algorithm, inside the completion.
#[derive(Debug, Default)]
pub struct FileStats {
    pub read_bytes: AtomicU64,
    pub readv_bytes: AtomicU64,
    pub write_bytes: AtomicU64,
}

impl FileStats {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Statistics of one open session, as logged at close.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSummary {
    pub fd: Fd,
    pub path: String,
    pub adapter: AdapterKind,
    pub buffer_size: usize,
    pub start_time: DateTime<Utc>,
    /// Set once the session has ended
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub read_bytes: u64,
    pub readv_bytes: u64,
    pub read_aio_bytes: u64,
    pub write_bytes: u64,
    pub write_aio_bytes: u64,
    pub cache: CacheStatsSnapshot,
    pub io: AdapterStatsSnapshot,
}

struct OpenState {
    fd: Fd,
    path: String,
    flags: OpenFlags,
    algorithm: BufferAlgorithm,
    started: DateTime<Utc>,
    timer: Instant,
}

// =============================================================================
// Buffered file
// =============================================================================

/// [`OssFile`] that stages reads and writes in a per-file buffer.
pub struct BufferedFile {
    inner: Box<dyn OssFile>,
    store: Arc<dyn ObjectStore>,
    config: BufferConfig,
    open: Option<OpenState>,
    stats: FileStats,
    last_summary: Option<FileSummary>,
}

impl std::fmt::Debug for BufferedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedFile")
            .field("fd", &self.inner.fd())
            .field("path", &self.open.as_ref().map(|s| &s.path))
            .field("state", &self.cache_state())
            .finish()
    }
}

impl BufferedFile {
    /// Wrap `inner`; the adapter issues its transport calls on `store`, which
    /// must be the store `inner` opens its descriptors on.
    pub fn new(
        inner: Box<dyn OssFile>,
        store: Arc<dyn ObjectStore>,
        config: BufferConfig,
    ) -> Self {
        Self {
            inner,
            store,
            config,
            open: None,
            stats: FileStats::default(),
            last_summary: None,
        }
    }

    fn state(&self) -> Result<&OpenState> {
        self.open.as_ref().ok_or(Error::NotOpen)
    }

    /// Open state of a file opened for writing. Staged bytes are only
    /// flushed for such files, so anything else must not stage.
    fn writable(&self) -> Result<&OpenState> {
        let state = self.state()?;
        if !state.flags.is_write() {
            return Err(Error::transport(IoType::Write, libc::EBADF));
        }
        Ok(state)
    }

    /// Cache state while open.
    pub fn cache_state(&self) -> Option<CacheState> {
        self.open.as_ref().map(|s| s.algorithm.state())
    }

    /// Asynchronous operations not yet completed.
    pub fn outstanding_aio(&self) -> usize {
        self.open
            .as_ref()
            .map_or(0, |s| s.algorithm.outstanding_aio())
    }

    /// Write staged bytes to the store now; returns bytes written.
    pub fn flush(&self) -> Result<usize> {
        self.state()?.algorithm.flush_write_cache()
    }

    fn summarize(&self, state: &OpenState, ended: Option<DateTime<Utc>>) -> FileSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let cache = state.algorithm.stats();
        FileSummary {
            fd: state.fd,
            path: state.path.clone(),
            adapter: state.algorithm.adapter_kind(),
            buffer_size: state.algorithm.capacity(),
            start_time: state.started,
            end_time: ended,
            elapsed_ms: state.timer.elapsed().as_millis() as u64,
            read_bytes: load(&self.stats.read_bytes),
            readv_bytes: load(&self.stats.readv_bytes),
            read_aio_bytes: cache.aio_read_bytes,
            write_bytes: load(&self.stats.write_bytes),
            write_aio_bytes: cache.aio_write_bytes,
            cache,
            io: state.algorithm.adapter_stats(),
        }
    }
}

impl OssFile for BufferedFile {
    #[instrument(skip(self))]
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd> {
        if let Some(state) = &self.open {
            return Err(Error::InvalidArgument(format!(
                "file already open as fd {}",
                state.fd
            )));
        }
        self.config.validate()?;

        let fd = self.inner.open(path, flags)?;
        let algorithm = match build_algorithm(&self.config, Arc::clone(&self.store), fd) {
            Ok(algorithm) => algorithm,
            Err(e) => {
                if let Err(close_err) = self.inner.close() {
                    warn!(fd = %fd, error = %close_err, "close after failed buffer setup");
                }
                return Err(e);
            }
        };

        info!(
            fd = %fd,
            path,
            adapter = %algorithm.adapter_kind(),
            buffer_size = algorithm.capacity(),
            write = flags.is_write(),
            "opened buffered file"
        );

        self.stats = FileStats::default();
        self.open = Some(OpenState {
            fd,
            path: path.to_string(),
            flags,
            algorithm,
            started: Utc::now(),
            timer: Instant::now(),
        });
        Ok(fd)
    }

    #[instrument(skip(self))]
    fn close(&mut self) -> Result<()> {
        let state = self.open.take().ok_or(Error::NotOpen)?;
        let fd = state.fd;

        if !state.algorithm.wait_idle(self.config.close_wait()) {
            let outstanding = state.algorithm.outstanding_aio();
            warn!(
                fd = %fd,
                path = %state.path,
                outstanding,
                waited_ms = self.config.close_wait_ms,
                "asynchronous I/O still outstanding, not closing"
            );
            self.open = Some(state);
            return Err(Error::AioInFlight { fd, outstanding });
        }

        let flushed = if state.flags.is_write() {
            state.algorithm.flush_write_cache()
        } else {
            Ok(0)
        };
        let summary = self.summarize(&state, Some(Utc::now()));
        drop(state);

        if let Err(e) = flushed {
            warn!(fd = %fd, path = %summary.path, error = %e, "flush on close failed");
            if let Err(close_err) = self.inner.close() {
                warn!(fd = %fd, error = %close_err, "close after failed flush also failed");
            }
            self.last_summary = Some(summary);
            return Err(Error::FlushOnClose {
                fd,
                source: Box::new(e),
            });
        }

        let closed = self.inner.close();
        info!(
            fd = %fd,
            path = %summary.path,
            adapter = %summary.adapter,
            elapsed_ms = summary.elapsed_ms,
            read_bytes = summary.read_bytes,
            readv_bytes = summary.readv_bytes,
            read_aio_bytes = summary.read_aio_bytes,
            write_bytes = summary.write_bytes,
            write_aio_bytes = summary.write_aio_bytes,
            cache_hits = summary.cache.hits,
            cache_misses = summary.cache.misses,
            flushes = summary.cache.flushes,
            "closed buffered file"
        );
        self.last_summary = Some(summary);
        closed
    }

    fn fd(&self) -> Option<Fd> {
        self.open.as_ref().map(|s| s.fd)
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = self.state()?.algorithm.read(buf, offset)?;
        FileStats::add(&self.stats.read_bytes, n);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let n = self.writable()?.algorithm.write(buf, offset)?;
        FileStats::add(&self.stats.write_bytes, n);
        Ok(n)
    }

    fn read_aio(&self, req: AioRead) -> Result<()> {
        self.state()?.algorithm.read_aio(req)
    }

    fn write_aio(&self, req: AioWrite) -> Result<()> {
        self.writable()?.algorithm.write_aio(req)
    }

    fn read_raw(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.state()?;
        self.inner.read_raw(buf, offset)
    }

    fn readv(&self, iov: &mut [IoVec<'_>]) -> Result<usize> {
        self.state()?;
        let n = self.inner.readv(iov)?;
        FileStats::add(&self.stats.readv_bytes, n);
        Ok(n)
    }

    fn fstat(&self) -> Result<FileStat> {
        self.state()?;
        self.inner.fstat()
    }

    fn fsync(&self) -> Result<()> {
        self.state()?;
        self.inner.fsync()
    }

    fn ftruncate(&self, len: u64) -> Result<()> {
        self.state()?;
        self.inner.ftruncate(len)
    }

    fn summary(&self) -> Option<FileSummary> {
        match &self.open {
            Some(state) => Some(self.summarize(state, None)),
            None => self.last_summary.clone(),
        }
    }
}

impl Drop for BufferedFile {
    fn drop(&mut self) {
        if self.open.is_none() {
            return;
        }
        warn!(fd = ?self.fd(), "buffered file dropped while open, closing");
        if let Err(e) = self.close() {
            warn!(error = %e, "close on drop failed");
        }
    }
}
