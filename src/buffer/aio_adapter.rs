//! Asynchronous I/O adapter
//!
//! Submissions hand the store an owned completion context: a handle to the
//! shared buffer, a handle to the counters and the submit timestamp. The
//! store later runs the completion on one of its own threads, which applies
//! the result to the buffer, updates the counters and calls the caller's
//! [`IoDone`]. Nothing is looked up by descriptor at completion time.
//!
//! The blocking `read` / `write` entry points submit and then wait for the
//! completion, logging a warning each time the wait crosses the configured
//! threshold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, RecvTimeoutError};
use tracing::{debug, warn};

use super::adapter::{
    check_count, log_summary, rc, AdapterStats, AdapterStatsSnapshot, IoAdapter, IoDone,
};
use super::data::SharedBuffer;
use crate::config::AdapterKind;
use crate::error::{Error, Result};
use crate::store::{Fd, ObjectStore};

/// Adapter that issues asynchronous transport calls.
pub struct AsyncIoAdapter {
    buffer: SharedBuffer,
    store: Arc<dyn ObjectStore>,
    fd: Fd,
    stats: Arc<AdapterStats>,
    wait_warn: Duration,
}

impl AsyncIoAdapter {
    /// `wait_warn` is how long a blocking read/write waits before each warning.
    pub fn new(
        buffer: SharedBuffer,
        store: Arc<dyn ObjectStore>,
        fd: Fd,
        wait_warn: Duration,
    ) -> Self {
        Self {
            buffer,
            store,
            fd,
            stats: Arc::new(AdapterStats::new()),
            wait_warn,
        }
    }

    fn wait(
        &self,
        op: &str,
        offset: u64,
        count: usize,
        submit: impl FnOnce(IoDone) -> Result<()>,
    ) -> Result<usize> {
        let (tx, rx) = channel::bounded(1);
        submit(Box::new(move |result| {
            // Receiver is gone only if the waiter already gave up
            let _ = tx.send(result);
        }))?;

        let start = Instant::now();
        loop {
            match rx.recv_timeout(self.wait_warn) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        fd = %self.fd,
                        op,
                        offset,
                        count,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "slow asynchronous I/O, still waiting"
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Internal(format!(
                        "completion for aio {op} on fd {} dropped without result",
                        self.fd
                    )));
                }
            }
        }
    }
}

impl IoAdapter for AsyncIoAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Async
    }

    fn fd(&self) -> Fd {
        self.fd
    }

    fn read(&self, offset: u64, count: usize) -> Result<usize> {
        self.wait("read", offset, count, |done| self.submit_read(offset, count, done))
    }

    fn write(&self, offset: u64, count: usize) -> Result<usize> {
        self.wait("write", offset, count, |done| self.submit_write(offset, count, done))
    }

    fn submit_read(&self, offset: u64, count: usize, done: IoDone) -> Result<()> {
        check_count(&self.buffer.lock(), count)?;

        let fd = self.fd;
        let buffer = Arc::clone(&self.buffer);
        let stats = Arc::clone(&self.stats);
        let submitted = Instant::now();

        self.store.submit_read(
            fd,
            offset,
            count,
            Box::new(move |result| {
                let elapsed = submitted.elapsed();
                let result = result.and_then(|bytes| {
                    let mut buffer = buffer.lock();
                    let n = bytes.len().min(count);
                    buffer.raw_mut()[..n].copy_from_slice(&bytes[..n]);
                    buffer.set_length(n)?;
                    buffer.set_starting_offset(offset);
                    buffer.set_valid(true);
                    Ok(n)
                });
                debug!(
                    fd = %fd,
                    rc = rc(&result),
                    offset,
                    count,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "aio read complete"
                );
                if let Ok(n) = result {
                    stats.read.record(n, elapsed);
                }
                done(result);
            }),
        )
    }

    fn submit_write(&self, offset: u64, count: usize, done: IoDone) -> Result<()> {
        let data = {
            let buffer = self.buffer.lock();
            check_count(&buffer, count)?;
            Bytes::copy_from_slice(&buffer.raw()[..count])
        };

        let fd = self.fd;
        let stats = Arc::clone(&self.stats);
        let submitted = Instant::now();

        self.store.submit_write(
            fd,
            offset,
            data,
            Box::new(move |result| {
                let elapsed = submitted.elapsed();
                debug!(
                    fd = %fd,
                    rc = rc(&result),
                    offset,
                    count,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "aio write complete"
                );
                if let Ok(n) = result {
                    stats.write.record(n, elapsed);
                }
                done(result);
            }),
        )
    }

    fn stats(&self) -> AdapterStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for AsyncIoAdapter {
    fn drop(&mut self) {
        log_summary(AdapterKind::Async, self.fd, &self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferData;
    use crate::store::{AioMode, MemoryStore, OpenFlags};

    fn setup(mode: AioMode) -> (MemoryStore, SharedBuffer, AsyncIoAdapter) {
        let store = MemoryStore::with_aio_mode(mode);
        store.insert("/obj", b"0123456789".to_vec());
        let fd = store.open("/obj", OpenFlags::read_write()).unwrap();
        let buffer = BufferData::new(8).unwrap().into_shared();
        let adapter = AsyncIoAdapter::new(
            Arc::clone(&buffer),
            Arc::new(store.clone()),
            fd,
            Duration::from_millis(50),
        );
        (store, buffer, adapter)
    }

    #[test]
    fn test_blocking_read_waits_for_completion() {
        let (store, buffer, adapter) = setup(AioMode::Threaded);
        assert_eq!(adapter.read(2, 8).unwrap(), 8);

        let buffer = buffer.lock();
        assert!(buffer.is_valid());
        assert_eq!(buffer.starting_offset(), 2);
        assert_eq!(&buffer.raw()[..8], b"23456789");
        assert_eq!(store.counts().aio_reads, 1);
        assert_eq!(adapter.stats().read.bytes, 8);
    }

    #[test]
    fn test_completion_updates_buffer_later() {
        let (store, buffer, adapter) = setup(AioMode::Deferred);
        let (tx, rx) = crossbeam::channel::bounded(1);
        adapter
            .submit_read(0, 4, Box::new(move |r| tx.send(r.ok()).unwrap()))
            .unwrap();

        assert!(!buffer.lock().is_valid());
        assert_eq!(adapter.stats().read.requests, 0);

        store.run_pending_completions();
        assert_eq!(rx.recv().unwrap(), Some(4));
        assert!(buffer.lock().is_valid());
        assert_eq!(adapter.stats().read.requests, 1);
    }

    #[test]
    fn test_write_snapshots_buffer_at_submit() {
        let (store, buffer, adapter) = setup(AioMode::Deferred);
        buffer.lock().raw_mut()[..3].copy_from_slice(b"abc");

        let (tx, rx) = crossbeam::channel::bounded(1);
        adapter
            .submit_write(0, 3, Box::new(move |r| tx.send(r.ok()).unwrap()))
            .unwrap();
        buffer.lock().raw_mut()[..3].copy_from_slice(b"zzz");

        store.run_pending_completions();
        assert_eq!(rx.recv().unwrap(), Some(3));
        assert_eq!(&store.object("/obj").unwrap()[..3], b"abc");
        assert_eq!(adapter.stats().write.bytes, 3);
    }

    #[test]
    fn test_submit_failure_is_immediate() {
        let (store, _buffer, adapter) = setup(AioMode::Threaded);
        store.fail_next_submits(1, libc::EAGAIN);
        let err = adapter.read(0, 4).unwrap_err();
        assert_eq!(err.errno(), -libc::EAGAIN);
        assert_eq!(adapter.stats().read.requests, 0);
    }

    #[test]
    fn test_completion_error_propagates() {
        let (store, buffer, adapter) = setup(AioMode::Threaded);
        store.fail_next_reads(1, libc::EIO);
        let err = adapter.read(0, 4).unwrap_err();
        assert_eq!(err.errno(), -libc::EIO);
        assert!(!buffer.lock().is_valid());
    }
}
