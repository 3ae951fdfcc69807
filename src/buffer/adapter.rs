//! I/O adapters
//!
//! An adapter moves the contents of one [`BufferData`] to or from a file
//! descriptor, one transport call at a time, and keeps per-direction request,
//! byte and latency counters for that descriptor. The algorithm above it
//! decides *when* to read or write; the adapter only decides *how*.
//!
//! ```text
//!        BufferAlgorithm
//!              │  read / write / submit_read / submit_write
//!              ▼
//!   ┌─────────────────────┐        ┌──────────────────────┐
//!   │    SyncIoAdapter    │   or   │    AsyncIoAdapter    │
//!   │  pread / pwrite on  │        │  submit + completion │
//!   │  the calling thread │        │  on a store thread   │
//!   └──────────┬──────────┘        └──────────┬───────────┘
//!              └──────────────┬───────────────┘
//!                             ▼
//!                        ObjectStore
//! ```
//!
//! Counters move only after a transport call has succeeded. Failures are
//! returned unchanged and leave both the counters and the buffer metadata as
//! they were.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use super::data::{BufferData, SharedBuffer};
use crate::config::AdapterKind;
use crate::error::{Error, Result};
use crate::store::{Fd, ObjectStore};

/// Completion for an adapter-level asynchronous operation: bytes moved.
pub type IoDone = Box<dyn FnOnce(Result<usize>) + Send + 'static>;

// =============================================================================
// Adapter trait
// =============================================================================

/// Executes single reads and writes of a buffer against one descriptor.
pub trait IoAdapter: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> AdapterKind;

    /// The descriptor the adapter is bound to.
    fn fd(&self) -> Fd;

    /// Fill the buffer with up to `count` bytes read at `offset`.
    ///
    /// On success the buffer's length, starting offset and validity describe
    /// the bytes read.
    fn read(&self, offset: u64, count: usize) -> Result<usize>;

    /// Write the first `count` buffered bytes at `offset`.
    fn write(&self, offset: u64, count: usize) -> Result<usize>;

    /// Start a read; `done` receives the outcome exactly once.
    ///
    /// An `Err` return means the read was never started and `done` is
    /// dropped without being called.
    fn submit_read(&self, offset: u64, count: usize, done: IoDone) -> Result<()>;

    /// Start a write of the first `count` buffered bytes.
    fn submit_write(&self, offset: u64, count: usize, done: IoDone) -> Result<()>;

    /// Current counter values.
    fn stats(&self) -> AdapterStatsSnapshot;
}

/// Reject requests the buffer cannot hold.
pub(crate) fn check_count(buffer: &BufferData, count: usize) -> Result<()> {
    if count > buffer.capacity() {
        return Err(Error::InvalidArgument(format!(
            "request of {} bytes exceeds buffer capacity {}",
            count,
            buffer.capacity()
        )));
    }
    Ok(())
}

/// Return code as logged: bytes moved, or the negative errno.
pub(crate) fn rc(result: &Result<usize>) -> i64 {
    match result {
        Ok(n) => *n as i64,
        Err(e) => e.errno() as i64,
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for one direction of transfer.
#[derive(Debug, Default)]
pub struct DirectionStats {
    /// Completed requests
    pub requests: AtomicU64,

    /// Bytes transferred
    pub bytes: AtomicU64,

    /// Sum of request latencies (microseconds)
    pub latency_us_total: AtomicU64,

    /// Longest single request (microseconds)
    pub latency_us_longest: AtomicU64,
}

impl DirectionStats {
    /// Record one completed request.
    pub fn record(&self, bytes: usize, latency: Duration) {
        let us = latency.as_micros() as u64;
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.latency_us_total.fetch_add(us, Ordering::Relaxed);
        self.latency_us_longest.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DirectionSnapshot {
        DirectionSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            latency_us_total: self.latency_us_total.load(Ordering::Relaxed),
            latency_us_longest: self.latency_us_longest.load(Ordering::Relaxed),
        }
    }
}

/// Read and write counters of one adapter.
#[derive(Debug, Default)]
pub struct AdapterStats {
    pub read: DirectionStats,
    pub write: DirectionStats,
}

impl AdapterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            read: self.read.snapshot(),
            write: self.write.snapshot(),
        }
    }
}

/// Point-in-time copy of [`DirectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectionSnapshot {
    pub requests: u64,
    pub bytes: u64,
    pub latency_us_total: u64,
    pub latency_us_longest: u64,
}

impl DirectionSnapshot {
    /// Mean latency per request.
    pub fn avg_latency(&self) -> Duration {
        if self.requests == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_us_total / self.requests)
    }
}

/// Point-in-time copy of [`AdapterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStatsSnapshot {
    pub read: DirectionSnapshot,
    pub write: DirectionSnapshot,
}

pub(crate) fn log_summary(kind: AdapterKind, fd: Fd, stats: &AdapterStats) {
    let s = stats.snapshot();
    debug!(
        adapter = %kind,
        fd = %fd,
        read_requests = s.read.requests,
        read_bytes = s.read.bytes,
        read_latency_us_longest = s.read.latency_us_longest,
        read_latency_us_avg = s.read.avg_latency().as_micros() as u64,
        write_requests = s.write.requests,
        write_bytes = s.write.bytes,
        write_latency_us_longest = s.write.latency_us_longest,
        write_latency_us_avg = s.write.avg_latency().as_micros() as u64,
        "io adapter summary"
    );
}

// =============================================================================
// Synchronous adapter
// =============================================================================

/// Blocking positioned reads and writes on the calling thread.
pub struct SyncIoAdapter {
    buffer: SharedBuffer,
    store: Arc<dyn ObjectStore>,
    fd: Fd,
    stats: AdapterStats,
}

impl SyncIoAdapter {
    pub fn new(buffer: SharedBuffer, store: Arc<dyn ObjectStore>, fd: Fd) -> Self {
        Self {
            buffer,
            store,
            fd,
            stats: AdapterStats::new(),
        }
    }
}

impl IoAdapter for SyncIoAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Sync
    }

    fn fd(&self) -> Fd {
        self.fd
    }

    fn read(&self, offset: u64, count: usize) -> Result<usize> {
        let mut buffer = self.buffer.lock();
        check_count(&buffer, count)?;

        let start = Instant::now();
        let result = self
            .store
            .pread(self.fd, &mut buffer.raw_mut()[..count], offset);
        let elapsed = start.elapsed();
        debug!(
            fd = %self.fd,
            rc = rc(&result),
            offset,
            count,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "sync read"
        );

        let n = result?;
        buffer.set_length(n)?;
        buffer.set_starting_offset(offset);
        buffer.set_valid(true);
        self.stats.read.record(n, elapsed);
        Ok(n)
    }

    fn write(&self, offset: u64, count: usize) -> Result<usize> {
        let buffer = self.buffer.lock();
        check_count(&buffer, count)?;

        let start = Instant::now();
        let result = self.store.pwrite(self.fd, &buffer.raw()[..count], offset);
        let elapsed = start.elapsed();
        debug!(
            fd = %self.fd,
            rc = rc(&result),
            offset,
            count,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "sync write"
        );

        let n = result?;
        self.stats.write.record(n, elapsed);
        Ok(n)
    }

    fn submit_read(&self, offset: u64, count: usize, done: IoDone) -> Result<()> {
        check_count(&self.buffer.lock(), count)?;
        done(self.read(offset, count));
        Ok(())
    }

    fn submit_write(&self, offset: u64, count: usize, done: IoDone) -> Result<()> {
        check_count(&self.buffer.lock(), count)?;
        done(self.write(offset, count));
        Ok(())
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for SyncIoAdapter {
    fn drop(&mut self) {
        log_summary(AdapterKind::Sync, self.fd, &self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, OpenFlags};
    use assert_matches::assert_matches;

    fn setup(capacity: usize) -> (MemoryStore, SharedBuffer, SyncIoAdapter) {
        let store = MemoryStore::new();
        store.insert("/obj", (0..=255u8).cycle().take(1000).collect::<Vec<_>>());
        let fd = store.open("/obj", OpenFlags::read_write()).unwrap();
        let buffer = BufferData::new(capacity).unwrap().into_shared();
        let adapter = SyncIoAdapter::new(Arc::clone(&buffer), Arc::new(store.clone()), fd);
        (store, buffer, adapter)
    }

    #[test]
    fn test_read_sets_metadata() {
        let (_store, buffer, adapter) = setup(64);
        assert_eq!(adapter.read(10, 32).unwrap(), 32);

        let buffer = buffer.lock();
        assert!(buffer.is_valid());
        assert_eq!(buffer.len(), 32);
        assert_eq!(buffer.starting_offset(), 10);
        assert_eq!(buffer.raw()[0], 10);

        let stats = adapter.stats();
        assert_eq!(stats.read.requests, 1);
        assert_eq!(stats.read.bytes, 32);
    }

    #[test]
    fn test_short_read_at_eof() {
        let (_store, buffer, adapter) = setup(64);
        assert_eq!(adapter.read(990, 64).unwrap(), 10);
        assert_eq!(buffer.lock().len(), 10);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let (store, _buffer, adapter) = setup(16);
        assert_matches!(adapter.read(0, 17), Err(Error::InvalidArgument(_)));
        assert_matches!(adapter.write(0, 17), Err(Error::InvalidArgument(_)));
        assert_eq!(store.counts().preads, 0);
        assert_eq!(store.counts().pwrites, 0);
    }

    #[test]
    fn test_failure_leaves_counters_and_metadata() {
        let (store, buffer, adapter) = setup(16);
        store.fail_next_reads(1, libc::EIO);

        let err = adapter.read(0, 16).unwrap_err();
        assert_eq!(err.errno(), -libc::EIO);
        assert!(!buffer.lock().is_valid());
        assert_eq!(adapter.stats().read.requests, 0);
    }

    #[test]
    fn test_write_records_stats() {
        let (store, buffer, adapter) = setup(16);
        buffer.lock().raw_mut()[..4].copy_from_slice(b"wxyz");

        assert_eq!(adapter.write(100, 4).unwrap(), 4);
        assert_eq!(&store.object("/obj").unwrap()[100..104], b"wxyz");

        let stats = adapter.stats();
        assert_eq!(stats.write.requests, 1);
        assert_eq!(stats.write.bytes, 4);
        assert!(stats.write.latency_us_longest <= stats.write.latency_us_total);
    }

    #[test]
    fn test_submit_runs_inline() {
        let (_store, _buffer, adapter) = setup(16);
        let (tx, rx) = crossbeam::channel::bounded(1);
        adapter
            .submit_read(0, 8, Box::new(move |r| tx.send(r.ok()).unwrap()))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(8));
    }

    #[test]
    fn test_direction_avg_latency() {
        let stats = DirectionStats::default();
        stats.record(10, Duration::from_micros(100));
        stats.record(10, Duration::from_micros(300));
        let snap = stats.snapshot();
        assert_eq!(snap.avg_latency(), Duration::from_micros(200));
        assert_eq!(snap.latency_us_longest, 300);
        assert_eq!(DirectionSnapshot::default().avg_latency(), Duration::ZERO);
    }
}
