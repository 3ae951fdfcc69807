//! In-memory object store
//!
//! A process-local [`ObjectStore`] used by the test suite and for dry runs.
//! Besides holding objects it records every transport call it sees, keeps a
//! log of writes, and can be told to fail the next N calls of a kind with a
//! chosen errno. Asynchronous completions run either on a freshly spawned
//! thread (the default) or are parked until [`MemoryStore::run_pending_completions`]
//! is called, which lets tests observe an operation while it is in flight.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use super::{
    FileStat, Fd, IoType, ObjectStore, OpenFlags, ReadCompletion, WriteCompletion,
};
use crate::error::{Error, Result};

/// First descriptor handed out; 0-2 are left to stdio by convention.
const FIRST_FD: i32 = 3;

/// How asynchronous completions are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AioMode {
    /// Each completion runs on its own spawned thread.
    #[default]
    Threaded,
    /// Completions are queued until `run_pending_completions` is called.
    Deferred,
}

/// One write observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub fd: Fd,
    pub offset: u64,
    pub len: usize,
    /// Whether the write arrived through `submit_write`
    pub aio: bool,
}

/// Snapshot of the transport calls made against the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub opens: u64,
    pub closes: u64,
    pub preads: u64,
    pub pwrites: u64,
    pub aio_reads: u64,
    pub aio_writes: u64,
    pub fsyncs: u64,
    pub truncates: u64,
}

impl StoreCallCounts {
    /// All reads, synchronous and asynchronous.
    pub fn total_reads(&self) -> u64 {
        self.preads + self.aio_reads
    }

    /// All writes, synchronous and asynchronous.
    pub fn total_writes(&self) -> u64 {
        self.pwrites + self.aio_writes
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    opens: AtomicU64,
    closes: AtomicU64,
    preads: AtomicU64,
    pwrites: AtomicU64,
    aio_reads: AtomicU64,
    aio_writes: AtomicU64,
    fsyncs: AtomicU64,
    truncates: AtomicU64,
}

impl CallCounters {
    fn snapshot(&self) -> StoreCallCounts {
        StoreCallCounts {
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            preads: self.preads.load(Ordering::Relaxed),
            pwrites: self.pwrites.load(Ordering::Relaxed),
            aio_reads: self.aio_reads.load(Ordering::Relaxed),
            aio_writes: self.aio_writes.load(Ordering::Relaxed),
            fsyncs: self.fsyncs.load(Ordering::Relaxed),
            truncates: self.truncates.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Fault {
    remaining: u32,
    errno: i32,
}

impl Fault {
    fn take(&mut self) -> Option<i32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.errno)
    }
}

#[derive(Debug, Default)]
struct Faults {
    open: Fault,
    close: Fault,
    read: Fault,
    write: Fault,
    submit: Fault,
}

#[derive(Debug)]
struct Object {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

impl Object {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            modified: Utc::now(),
        }
    }

    fn stat(&self) -> FileStat {
        FileStat {
            size: self.data.len() as u64,
            modified: self.modified,
        }
    }
}

#[derive(Debug)]
struct Handle {
    object: Arc<RwLock<Object>>,
    flags: OpenFlags,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    objects: DashMap<String, Arc<RwLock<Object>>>,
    handles: DashMap<Fd, Handle>,
    next_fd: AtomicI32,
    counters: CallCounters,
    writes: Mutex<Vec<WriteRecord>>,
    faults: Mutex<Faults>,
    mode: AioMode,
    pending: Mutex<Vec<Job>>,
}

impl Inner {
    fn handle(&self, fd: Fd, op: IoType) -> Result<(Arc<RwLock<Object>>, OpenFlags)> {
        self.handles
            .get(&fd)
            .map(|h| (Arc::clone(&h.object), h.flags))
            .ok_or_else(|| Error::transport(op, libc::EBADF))
    }

    fn read_at(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        if let Some(errno) = self.faults.lock().read.take() {
            return Err(Error::transport(IoType::Read, errno));
        }
        let (object, flags) = self.handle(fd, IoType::Read)?;
        if !flags.read {
            return Err(Error::transport(IoType::Read, libc::EBADF));
        }

        let object = object.read();
        let size = object.data.len() as u64;
        if offset >= size {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(object.data.len() - start);
        buf[..n].copy_from_slice(&object.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, fd: Fd, data: &[u8], offset: u64, aio: bool) -> Result<usize> {
        if let Some(errno) = self.faults.lock().write.take() {
            return Err(Error::transport(IoType::Write, errno));
        }
        let (object, flags) = self.handle(fd, IoType::Write)?;
        if !flags.write {
            return Err(Error::transport(IoType::Write, libc::EBADF));
        }

        {
            let mut object = object.write();
            let start = offset as usize;
            let end = start + data.len();
            if object.data.len() < end {
                object.data.resize(end, 0);
            }
            object.data[start..end].copy_from_slice(data);
            object.modified = Utc::now();
        }

        self.writes.lock().push(WriteRecord {
            fd,
            offset,
            len: data.len(),
            aio,
        });
        trace!(fd = %fd, offset, len = data.len(), aio, "memory store write");
        Ok(data.len())
    }

    fn dispatch(&self, job: Job) {
        match self.mode {
            AioMode::Threaded => {
                std::thread::spawn(job);
            }
            AioMode::Deferred => self.pending.lock().push(job),
        }
    }
}

/// In-memory [`ObjectStore`] with call accounting and fault injection.
///
/// Cloning yields another handle to the same objects.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_aio_mode(AioMode::Threaded)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("objects", &self.inner.objects.len())
            .field("open_fds", &self.inner.handles.len())
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl MemoryStore {
    /// Create an empty store whose completions run on spawned threads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with the given completion delivery mode.
    pub fn with_aio_mode(mode: AioMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects: DashMap::new(),
                handles: DashMap::new(),
                next_fd: AtomicI32::new(FIRST_FD),
                counters: CallCounters::default(),
                writes: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                mode,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Store an object, replacing any previous content.
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.inner
            .objects
            .insert(path.into(), Arc::new(RwLock::new(Object::new(data.into()))));
    }

    /// Copy of an object's content.
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .objects
            .get(path)
            .map(|object| object.read().data.clone())
    }

    /// Transport calls seen so far.
    pub fn counts(&self) -> StoreCallCounts {
        self.inner.counters.snapshot()
    }

    /// Every successful write, in arrival order.
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.inner.writes.lock().clone()
    }

    /// Number of descriptors currently open.
    pub fn open_fds(&self) -> usize {
        self.inner.handles.len()
    }

    /// Fail the next `n` opens with `errno`.
    pub fn fail_next_opens(&self, n: u32, errno: i32) {
        self.inner.faults.lock().open = Fault { remaining: n, errno };
    }

    /// Fail the next `n` closes with `errno` (the descriptor is still released).
    pub fn fail_next_closes(&self, n: u32, errno: i32) {
        self.inner.faults.lock().close = Fault { remaining: n, errno };
    }

    /// Fail the next `n` reads (synchronous or completed asynchronously).
    pub fn fail_next_reads(&self, n: u32, errno: i32) {
        self.inner.faults.lock().read = Fault { remaining: n, errno };
    }

    /// Fail the next `n` writes (synchronous or completed asynchronously).
    pub fn fail_next_writes(&self, n: u32, errno: i32) {
        self.inner.faults.lock().write = Fault { remaining: n, errno };
    }

    /// Reject the next `n` asynchronous submissions at submit time.
    pub fn fail_next_submits(&self, n: u32, errno: i32) {
        self.inner.faults.lock().submit = Fault { remaining: n, errno };
    }

    /// Completions parked in [`AioMode::Deferred`].
    pub fn pending_completions(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Run every parked completion on a separate thread and wait for them.
    ///
    /// Returns the number of completions delivered.
    pub fn run_pending_completions(&self) -> usize {
        let jobs: Vec<Job> = std::mem::take(&mut *self.inner.pending.lock());
        let count = jobs.len();
        if count == 0 {
            return 0;
        }

        let worker = std::thread::spawn(move || {
            for job in jobs {
                job();
            }
        });
        if worker.join().is_err() {
            warn!("memory store completion panicked");
        }
        count
    }

    fn check_submit(&self, fd: Fd) -> Result<()> {
        if let Some(errno) = self.inner.faults.lock().submit.take() {
            return Err(Error::transport(IoType::Submit, errno));
        }
        if !self.inner.handles.contains_key(&fd) {
            return Err(Error::transport(IoType::Submit, libc::EBADF));
        }
        Ok(())
    }
}

impl ObjectStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd> {
        self.inner.counters.opens.fetch_add(1, Ordering::Relaxed);
        if let Some(errno) = self.inner.faults.lock().open.take() {
            return Err(Error::transport(IoType::Open, errno));
        }

        let object = match self.inner.objects.get(path) {
            Some(existing) => {
                let object = Arc::clone(existing.value());
                if flags.truncate && flags.write {
                    let mut guard = object.write();
                    guard.data.clear();
                    guard.modified = Utc::now();
                }
                object
            }
            None if flags.create => {
                let object = Arc::new(RwLock::new(Object::new(Vec::new())));
                self.inner
                    .objects
                    .insert(path.to_string(), Arc::clone(&object));
                object
            }
            None => return Err(Error::NotFound(path.to_string())),
        };

        let fd = Fd(self.inner.next_fd.fetch_add(1, Ordering::Relaxed));
        self.inner.handles.insert(fd, Handle { object, flags });
        Ok(fd)
    }

    fn close(&self, fd: Fd) -> Result<()> {
        self.inner.counters.closes.fetch_add(1, Ordering::Relaxed);
        let removed = self.inner.handles.remove(&fd);
        if let Some(errno) = self.inner.faults.lock().close.take() {
            return Err(Error::transport(IoType::Close, errno));
        }
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::transport(IoType::Close, libc::EBADF)),
        }
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner.counters.preads.fetch_add(1, Ordering::Relaxed);
        self.inner.read_at(fd, buf, offset)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64) -> Result<usize> {
        self.inner.counters.pwrites.fetch_add(1, Ordering::Relaxed);
        self.inner.write_at(fd, buf, offset, false)
    }

    fn submit_read(&self, fd: Fd, offset: u64, len: usize, done: ReadCompletion) -> Result<()> {
        self.check_submit(fd)?;
        self.inner.counters.aio_reads.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        self.inner.dispatch(Box::new(move || {
            let mut buf = vec![0u8; len];
            let result = inner.read_at(fd, &mut buf, offset).map(|n| {
                buf.truncate(n);
                Bytes::from(buf)
            });
            done(result);
        }));
        Ok(())
    }

    fn submit_write(
        &self,
        fd: Fd,
        offset: u64,
        data: Bytes,
        done: WriteCompletion,
    ) -> Result<()> {
        self.check_submit(fd)?;
        self.inner.counters.aio_writes.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        self.inner.dispatch(Box::new(move || {
            done(inner.write_at(fd, &data, offset, true));
        }));
        Ok(())
    }

    fn fstat(&self, fd: Fd) -> Result<FileStat> {
        let (object, _) = self.inner.handle(fd, IoType::Stat)?;
        let stat = object.read().stat();
        Ok(stat)
    }

    fn fsync(&self, fd: Fd) -> Result<()> {
        self.inner.counters.fsyncs.fetch_add(1, Ordering::Relaxed);
        self.inner.handle(fd, IoType::Sync).map(|_| ())
    }

    fn ftruncate(&self, fd: Fd, len: u64) -> Result<()> {
        self.inner.counters.truncates.fetch_add(1, Ordering::Relaxed);
        let (object, flags) = self.inner.handle(fd, IoType::Truncate)?;
        if !flags.write {
            return Err(Error::transport(IoType::Truncate, libc::EBADF));
        }
        let mut object = object.write();
        object.data.resize(len as usize, 0);
        object.modified = Utc::now();
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        self.inner
            .objects
            .get(path)
            .map(|object| object.read().stat())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn truncate(&self, path: &str, len: u64) -> Result<()> {
        self.inner.counters.truncates.fetch_add(1, Ordering::Relaxed);
        let object = self
            .inner
            .objects
            .get(path)
            .map(|object| Arc::clone(object.value()))
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let mut object = object.write();
        object.data.resize(len as usize, 0);
        object.modified = Utc::now();
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<()> {
        self.inner
            .objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_open_missing_without_create() {
        let store = MemoryStore::new();
        let result = store.open("/missing", OpenFlags::read_only());
        assert_matches!(result, Err(Error::NotFound(path)) if path == "/missing");
    }

    #[test]
    fn test_pwrite_then_pread() {
        let store = MemoryStore::new();
        let fd = store.open("/obj", OpenFlags::create_truncate()).unwrap();
        assert_eq!(store.pwrite(fd, b"hello world", 0).unwrap(), 11);
        store.close(fd).unwrap();

        let fd = store.open("/obj", OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(store.pread(fd, &mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");

        // Past the end
        assert_eq!(store.pread(fd, &mut buf, 100).unwrap(), 0);
        store.close(fd).unwrap();

        let counts = store.counts();
        assert_eq!(counts.pwrites, 1);
        assert_eq!(counts.preads, 2);
        assert_eq!(counts.opens, 2);
        assert_eq!(counts.closes, 2);
    }

    #[test]
    fn test_write_extends_with_zeros() {
        let store = MemoryStore::new();
        let fd = store.open("/sparse", OpenFlags::create_truncate()).unwrap();
        store.pwrite(fd, b"xy", 4).unwrap();
        assert_eq!(store.object("/sparse").unwrap(), vec![0, 0, 0, 0, b'x', b'y']);
    }

    #[test]
    fn test_read_only_descriptor_rejects_write() {
        let store = MemoryStore::new();
        store.insert("/ro", b"data".to_vec());
        let fd = store.open("/ro", OpenFlags::read_only()).unwrap();
        let err = store.pwrite(fd, b"x", 0).unwrap_err();
        assert_eq!(err.errno(), -libc::EBADF);
    }

    #[test]
    fn test_injected_write_fault() {
        let store = MemoryStore::new();
        let fd = store.open("/f", OpenFlags::create_truncate()).unwrap();
        store.fail_next_writes(1, libc::EIO);

        let err = store.pwrite(fd, b"abc", 0).unwrap_err();
        assert_eq!(err.errno(), -libc::EIO);
        assert!(store.write_log().is_empty());

        assert_eq!(store.pwrite(fd, b"abc", 0).unwrap(), 3);
        assert_eq!(store.write_log().len(), 1);
    }

    #[test]
    fn test_failed_close_still_releases_fd() {
        let store = MemoryStore::new();
        let fd = store.open("/f", OpenFlags::create_truncate()).unwrap();
        store.fail_next_closes(1, libc::EIO);
        assert!(store.close(fd).is_err());
        assert_eq!(store.open_fds(), 0);
    }

    #[test]
    fn test_deferred_completion() {
        let store = MemoryStore::with_aio_mode(AioMode::Deferred);
        store.insert("/obj", b"abcdef".to_vec());
        let fd = store.open("/obj", OpenFlags::read_only()).unwrap();

        let (tx, rx) = crossbeam::channel::bounded(1);
        store
            .submit_read(
                fd,
                2,
                3,
                Box::new(move |result| {
                    tx.send(result.map(|b| b.to_vec())).unwrap();
                }),
            )
            .unwrap();

        assert_eq!(store.pending_completions(), 1);
        assert!(rx.try_recv().is_err());

        assert_eq!(store.run_pending_completions(), 1);
        assert_eq!(rx.recv().unwrap().unwrap(), b"cde".to_vec());
    }

    #[test]
    fn test_submit_fault_does_not_invoke_completion() {
        let store = MemoryStore::new();
        let fd = store.open("/f", OpenFlags::create_truncate()).unwrap();
        store.fail_next_submits(1, libc::EAGAIN);

        let result = store.submit_write(
            fd,
            0,
            Bytes::from_static(b"x"),
            Box::new(|_| panic!("completion must not run")),
        );
        assert_eq!(result.unwrap_err().errno(), -libc::EAGAIN);
        assert_eq!(store.counts().aio_writes, 0);
    }

    #[test]
    fn test_unlink_and_stat() {
        let store = MemoryStore::new();
        store.insert("/a", vec![1u8; 10]);
        assert_eq!(store.stat("/a").unwrap().size, 10);
        store.truncate("/a", 4).unwrap();
        assert_eq!(store.stat("/a").unwrap().size, 4);
        store.unlink("/a").unwrap();
        assert_matches!(store.stat("/a"), Err(Error::NotFound(_)));
    }
}
