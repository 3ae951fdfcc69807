//! Buffering algorithm
//!
//! Owns the staging buffer and the adapter of one open file and decides when
//! bytes move. Reads are served from the cached image when it covers them
//! and otherwise refill the whole buffer from the current offset. Writes are
//! staged and only reach the store when the next write is not contiguous,
//! would overflow the buffer, a read misses, or the file flushes.
//!
//! # States
//!
//! ```text
//!            write                      read miss / fill
//!   Idle ───────────────▶ WritePending ◀───────┐
//!    │                      │    ▲             │
//!    │ read fill            │    │ write       │
//!    ▼        flush         ▼    │             │
//!   CachedValid ◀───────────┘────┘             │
//!    │                                         │
//!    └────── read_aio / write_aio ──▶ AioInFlight ──(completion)──▶ CachedValid
//! ```
//!
//! Synchronous operations of one file are serialised by an internal lock.
//! At most one asynchronous operation may be outstanding; a second one, or
//! a synchronous operation issued while it runs, is refused with
//! `Error::AioInFlight`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::debug;

use super::adapter::{AdapterStatsSnapshot, IoAdapter};
use super::data::{BufferData, SharedBuffer};
use crate::aio::{AioRead, AioWrite, InFlight};
use crate::config::AdapterKind;
use crate::error::{Error, Result};
use crate::store::{checked_end, Fd, IoType};

/// Observable state of the staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheState {
    /// Nothing cached
    Idle,
    /// The buffer holds a clean image of a file range
    CachedValid,
    /// The buffer holds staged writes not yet flushed
    WritePending,
    /// An asynchronous operation is outstanding
    AioInFlight,
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheState::Idle => write!(f, "idle"),
            CacheState::CachedValid => write!(f, "cached"),
            CacheState::WritePending => write!(f, "write-pending"),
            CacheState::AioInFlight => write!(f, "aio-in-flight"),
        }
    }
}

/// Cache effectiveness counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub flushes: AtomicU64,
    pub flushed_bytes: AtomicU64,
    /// Bytes delivered to completed asynchronous reads
    pub aio_read_bytes: AtomicU64,
    /// Bytes written by completed asynchronous writes
    pub aio_write_bytes: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_bytes: self.flushed_bytes.load(Ordering::Relaxed),
            aio_read_bytes: self.aio_read_bytes.load(Ordering::Relaxed),
            aio_write_bytes: self.aio_write_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
    pub flushed_bytes: u64,
    pub aio_read_bytes: u64,
    pub aio_write_bytes: u64,
}

#[derive(Debug, Default)]
struct Staging {
    /// Buffer holds writes the store has not seen
    dirty: bool,
}

/// The part of a clean image an asynchronous write overwrites.
struct CachedImage {
    offset: u64,
    len: usize,
    head: Vec<u8>,
}

impl CachedImage {
    fn restore(self, buffer: &mut BufferData) {
        buffer.raw_mut()[..self.head.len()].copy_from_slice(&self.head);
        buffer.set_starting_offset(self.offset);
        if buffer.set_length(self.len).is_ok() {
            buffer.set_valid(true);
        }
    }
}

/// Cache fill and flush policy for one open file.
pub struct BufferAlgorithm {
    buffer: SharedBuffer,
    adapter: Box<dyn IoAdapter>,
    capacity: usize,
    staging: Mutex<Staging>,
    inflight: Arc<InFlight>,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for BufferAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAlgorithm")
            .field("fd", &self.adapter.fd())
            .field("adapter", &self.adapter.kind())
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .finish()
    }
}

impl BufferAlgorithm {
    /// Build over a buffer and the adapter bound to that same buffer.
    pub fn new(buffer: SharedBuffer, adapter: Box<dyn IoAdapter>) -> Self {
        let capacity = buffer.lock().capacity();
        Self {
            buffer,
            adapter,
            capacity,
            staging: Mutex::new(Staging::default()),
            inflight: Arc::new(InFlight::new()),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fd(&self) -> Fd {
        self.adapter.fd()
    }

    pub fn adapter_kind(&self) -> AdapterKind {
        self.adapter.kind()
    }

    pub fn adapter_stats(&self) -> AdapterStatsSnapshot {
        self.adapter.stats()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Asynchronous operations submitted and not yet completed.
    pub fn outstanding_aio(&self) -> usize {
        self.inflight.current()
    }

    /// Wait for outstanding asynchronous operations; `true` once drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inflight.wait_zero(timeout)
    }

    pub fn state(&self) -> CacheState {
        if self.inflight.current() > 0 {
            return CacheState::AioInFlight;
        }
        if self.staging.lock().dirty {
            return CacheState::WritePending;
        }
        if self.buffer.lock().is_valid() {
            CacheState::CachedValid
        } else {
            CacheState::Idle
        }
    }

    /// Lock the staging state, refusing while an asynchronous operation runs.
    fn lock_staging(&self) -> Result<MutexGuard<'_, Staging>> {
        let staging = self.staging.lock();
        let outstanding = self.inflight.current();
        if outstanding > 0 {
            return Err(Error::AioInFlight {
                fd: self.fd(),
                outstanding,
            });
        }
        Ok(staging)
    }

    // =========================================================================
    // Synchronous path
    // =========================================================================

    /// Read into `buf` starting at file offset `offset`.
    ///
    /// Returns the bytes delivered, fewer than requested only at end of file.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        checked_end(offset, buf.len())?;
        let mut staging = self.lock_staging()?;
        self.read_locked(&mut staging, buf, offset)
    }

    fn read_locked(&self, staging: &mut Staging, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;

            let hit = self.buffer.lock().copy_out(pos, &mut buf[done..]);
            if hit > 0 {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                done += hit;
                continue;
            }

            if staging.dirty {
                self.flush_locked(staging)?;
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);

            let filled = self.adapter.read(pos, self.capacity)?;
            if filled == 0 {
                break;
            }
            done += self.buffer.lock().copy_out(pos, &mut buf[done..]);
            if filled < self.capacity {
                // End of file
                break;
            }
        }
        Ok(done)
    }

    /// Stage `buf` for writing at file offset `offset`.
    ///
    /// Returns the bytes accepted. Staged bytes reach the store on a later
    /// flush, which happens implicitly when staging can't continue.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        checked_end(offset, buf.len())?;
        let mut staging = self.lock_staging()?;
        self.write_locked(&mut staging, buf, offset)
    }

    fn write_locked(&self, staging: &mut Staging, buf: &[u8], offset: u64) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let remaining = buf.len() - done;

            if staging.dirty {
                let (end, len) = {
                    let buffer = self.buffer.lock();
                    (buffer.end_offset(), buffer.len())
                };
                if end != pos || len + remaining > self.capacity {
                    self.flush_locked(staging)?;
                }
            }

            let mut buffer = self.buffer.lock();
            if !staging.dirty {
                buffer.invalidate();
                buffer.set_starting_offset(pos);
            }
            let at = buffer.len();
            let n = remaining.min(self.capacity - at);
            buffer.raw_mut()[at..at + n].copy_from_slice(&buf[done..done + n]);
            buffer.set_length(at + n)?;
            buffer.set_valid(true);
            staging.dirty = true;
            done += n;
        }
        Ok(done)
    }

    /// Write staged bytes to the store.
    ///
    /// Returns 0 without any transport call when nothing is staged. On
    /// failure the staged bytes are kept, so calling again reissues the same
    /// write.
    pub fn flush_write_cache(&self) -> Result<usize> {
        let mut staging = self.lock_staging()?;
        self.flush_locked(&mut staging)
    }

    fn flush_locked(&self, staging: &mut Staging) -> Result<usize> {
        if !staging.dirty {
            return Ok(0);
        }

        let (offset, len) = {
            let buffer = self.buffer.lock();
            (buffer.starting_offset(), buffer.len())
        };
        let written = self.adapter.write(offset, len)?;
        if written != len {
            debug!(fd = %self.fd(), offset, len, written, "short flush");
            return Err(Error::transport(IoType::Write, libc::EIO));
        }

        staging.dirty = false;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .flushed_bytes
            .fetch_add(written as u64, Ordering::Relaxed);
        debug!(fd = %self.fd(), offset, len, "flushed write cache");
        Ok(written)
    }

    // =========================================================================
    // Asynchronous path
    // =========================================================================

    /// Start an asynchronous read.
    ///
    /// A request the cached image fully covers, and one larger than the
    /// buffer, complete inline before this returns. `Err` means `req.done`
    /// will never be called.
    pub fn read_aio(&self, req: AioRead) -> Result<()> {
        let AioRead { offset, len, done } = req;
        checked_end(offset, len)?;
        let mut staging = self.lock_staging()?;

        let cached = {
            let buffer = self.buffer.lock();
            if buffer.covers(offset, len) {
                let mut out = vec![0u8; len];
                buffer.copy_out(offset, &mut out);
                Some(Bytes::from(out))
            } else {
                None
            }
        };
        if let Some(bytes) = cached {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.stats
                .aio_read_bytes
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            drop(staging);
            done(Ok(bytes));
            return Ok(());
        }

        if len > self.capacity {
            let mut out = vec![0u8; len];
            let result = self.read_locked(&mut staging, &mut out, offset);
            if let Ok(n) = result {
                self.stats
                    .aio_read_bytes
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            drop(staging);
            done(result.map(|n| {
                out.truncate(n);
                Bytes::from(out)
            }));
            return Ok(());
        }

        if staging.dirty {
            self.flush_locked(&mut staging)?;
        }
        self.begin_aio()?;
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        drop(staging);

        let buffer = Arc::clone(&self.buffer);
        let inflight = Arc::clone(&self.inflight);
        let stats = Arc::clone(&self.stats);
        let submitted = self.adapter.submit_read(
            offset,
            self.capacity,
            Box::new(move |result| {
                let result = result.map(|_| {
                    let mut out = vec![0u8; len];
                    let n = buffer.lock().copy_out(offset, &mut out);
                    out.truncate(n);
                    Bytes::from(out)
                });
                if let Ok(bytes) = &result {
                    stats
                        .aio_read_bytes
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                inflight.finish();
                done(result);
            }),
        );
        if submitted.is_err() {
            self.inflight.finish();
        }
        submitted
    }

    /// Start an asynchronous write.
    ///
    /// Staged writes are flushed first. A request larger than the buffer is
    /// written synchronously and completes inline.
    pub fn write_aio(&self, req: AioWrite) -> Result<()> {
        let AioWrite { offset, data, done } = req;
        checked_end(offset, data.len())?;
        let mut staging = self.lock_staging()?;

        if data.len() > self.capacity {
            let result = self
                .write_locked(&mut staging, &data, offset)
                .and_then(|n| self.flush_locked(&mut staging).map(|_| n));
            if let Ok(n) = result {
                self.stats
                    .aio_write_bytes
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            drop(staging);
            done(result);
            return Ok(());
        }

        if staging.dirty {
            self.flush_locked(&mut staging)?;
        }

        let len = data.len();
        self.begin_aio()?;
        let previous = {
            let mut buffer = self.buffer.lock();
            let previous = buffer.is_valid().then(|| CachedImage {
                offset: buffer.starting_offset(),
                len: buffer.len(),
                head: buffer.raw()[..len].to_vec(),
            });
            buffer.invalidate();
            buffer.raw_mut()[..len].copy_from_slice(&data);
            buffer.set_starting_offset(offset);
            if let Err(e) = buffer.set_length(len) {
                self.inflight.finish();
                return Err(e);
            }
            previous
        };
        drop(staging);

        let buffer = Arc::clone(&self.buffer);
        let inflight = Arc::clone(&self.inflight);
        let stats = Arc::clone(&self.stats);
        let submitted = self.adapter.submit_write(
            offset,
            len,
            Box::new(move |result| {
                if let Ok(n) = result {
                    stats.aio_write_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    if n == len {
                        buffer.lock().set_valid(true);
                    }
                }
                inflight.finish();
                done(result);
            }),
        );
        if submitted.is_err() {
            if let Some(image) = previous {
                image.restore(&mut self.buffer.lock());
            }
            self.inflight.finish();
        }
        submitted
    }

    fn begin_aio(&self) -> Result<()> {
        self.inflight
            .try_begin_exclusive()
            .map_err(|outstanding| Error::AioInFlight {
                fd: self.fd(),
                outstanding,
            })
    }
}
