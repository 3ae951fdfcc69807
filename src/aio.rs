//! Asynchronous request types and in-flight accounting
//!
//! An AIO request carries its target range and a completion that is invoked
//! exactly once, either inline (cache hit, oversized fallback) or later from
//! the store's completion thread. [`InFlight`] counts submissions that have
//! not completed yet so a file can refuse overlapping requests and wait for
//! the last completion before it closes.

use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::store::{ReadCompletion, WriteCompletion};

/// Asynchronous read of `len` bytes at `offset`.
pub struct AioRead {
    pub offset: u64,
    pub len: usize,
    /// Receives the bytes read, or the failure
    pub done: ReadCompletion,
}

impl AioRead {
    pub fn new(
        offset: u64,
        len: usize,
        done: impl FnOnce(crate::Result<Bytes>) + Send + 'static,
    ) -> Self {
        Self {
            offset,
            len,
            done: Box::new(done),
        }
    }
}

impl std::fmt::Debug for AioRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioRead")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Asynchronous write of `data` at `offset`.
pub struct AioWrite {
    pub offset: u64,
    pub data: Bytes,
    /// Receives the bytes written, or the failure
    pub done: WriteCompletion,
}

impl AioWrite {
    pub fn new(
        offset: u64,
        data: impl Into<Bytes>,
        done: impl FnOnce(crate::Result<usize>) + Send + 'static,
    ) -> Self {
        Self {
            offset,
            data: data.into(),
            done: Box::new(done),
        }
    }
}

impl std::fmt::Debug for AioWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioWrite")
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Counter of outstanding asynchronous operations.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a submission, unless one is already outstanding.
    ///
    /// Returns the current count on refusal.
    pub fn try_begin_exclusive(&self) -> std::result::Result<(), usize> {
        let mut count = self.count.lock();
        if *count > 0 {
            return Err(*count);
        }
        *count += 1;
        Ok(())
    }

    /// Register a completion.
    pub fn finish(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    /// Number of outstanding operations.
    pub fn current(&self) -> usize {
        *self.count.lock()
    }

    /// Block until nothing is outstanding or `timeout` elapses.
    ///
    /// Returns `true` when drained.
    pub fn wait_zero(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.drained.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}
