//! Local-filesystem object store
//!
//! Maps object paths onto files under a root directory. Synchronous calls use
//! positioned reads and writes on the calling thread; asynchronous submissions
//! are handed to the blocking pool of a tokio runtime, so completions always
//! arrive on a thread the caller does not own.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use super::{
    FileStat, Fd, IoType, ObjectStore, OpenFlags, ReadCompletion, WriteCompletion,
};
use crate::error::{Error, Result};

const FIRST_FD: i32 = 3;

#[derive(Debug)]
struct OpenFile {
    file: File,
    path: PathBuf,
}

/// [`ObjectStore`] backed by files under a local directory.
pub struct PosixStore {
    root: PathBuf,
    runtime: Handle,
    files: DashMap<Fd, Arc<OpenFile>>,
    next_fd: AtomicI32,
}

impl std::fmt::Debug for PosixStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixStore")
            .field("root", &self.root)
            .field("open_fds", &self.files.len())
            .finish()
    }
}

impl PosixStore {
    /// Create a store rooted at `root`; AIO completions run on `runtime`'s
    /// blocking pool.
    pub fn new(root: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self {
            root: root.into(),
            runtime,
            files: DashMap::new(),
            next_fd: AtomicI32::new(FIRST_FD),
        }
    }

    /// Root directory objects are resolved against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object path to a local path below the root.
    ///
    /// Leading slashes are ignored; `..` components are rejected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::InvalidArgument(format!(
                "object path escapes store root: {path}"
            )));
        }
        Ok(self.root.join(relative))
    }

    fn file(&self, fd: Fd, op: IoType) -> Result<Arc<OpenFile>> {
        self.files
            .get(&fd)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| Error::transport(op, libc::EBADF))
    }
}

fn map_not_found(err: io::Error, path: &str) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotFound(path.to_string())
    } else {
        Error::Io(err)
    }
}

/// Positioned read that keeps going until `buf` is full or end of file.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match read_at(file, &mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

fn write_full_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match write_at(file, &buf[done..], offset + done as u64) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

fn file_stat(metadata: &std::fs::Metadata) -> Result<FileStat> {
    let modified: DateTime<Utc> = metadata.modified()?.into();
    Ok(FileStat {
        size: metadata.len(),
        modified,
    })
}

impl ObjectStore for PosixStore {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd> {
        let local = self.resolve(path)?;
        if flags.create {
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .create(flags.create)
            .truncate(flags.truncate)
            .open(&local)
            .map_err(|e| map_not_found(e, path))?;

        let fd = Fd(self.next_fd.fetch_add(1, Ordering::Relaxed));
        debug!(fd = %fd, path = %local.display(), "posix store open");
        self.files.insert(fd, Arc::new(OpenFile { file, path: local }));
        Ok(fd)
    }

    fn close(&self, fd: Fd) -> Result<()> {
        let (_, open) = self
            .files
            .remove(&fd)
            .ok_or_else(|| Error::transport(IoType::Close, libc::EBADF))?;
        debug!(fd = %fd, path = %open.path.display(), "posix store close");
        Ok(())
    }

    fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        let open = self.file(fd, IoType::Read)?;
        Ok(read_full_at(&open.file, buf, offset)?)
    }

    fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64) -> Result<usize> {
        let open = self.file(fd, IoType::Write)?;
        Ok(write_full_at(&open.file, buf, offset)?)
    }

    fn submit_read(&self, fd: Fd, offset: u64, len: usize, done: ReadCompletion) -> Result<()> {
        let open = self.file(fd, IoType::Submit)?;
        trace!(fd = %fd, offset, len, "posix store submit read");

        self.runtime.spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let result = read_full_at(&open.file, &mut buf, offset)
                .map(|n| {
                    buf.truncate(n);
                    Bytes::from(buf)
                })
                .map_err(Error::from);
            done(result);
        });
        Ok(())
    }

    fn submit_write(
        &self,
        fd: Fd,
        offset: u64,
        data: Bytes,
        done: WriteCompletion,
    ) -> Result<()> {
        let open = self.file(fd, IoType::Submit)?;
        trace!(fd = %fd, offset, len = data.len(), "posix store submit write");

        self.runtime.spawn_blocking(move || {
            done(write_full_at(&open.file, &data, offset).map_err(Error::from));
        });
        Ok(())
    }

    fn fstat(&self, fd: Fd) -> Result<FileStat> {
        let open = self.file(fd, IoType::Stat)?;
        file_stat(&open.file.metadata()?)
    }

    fn fsync(&self, fd: Fd) -> Result<()> {
        let open = self.file(fd, IoType::Sync)?;
        open.file.sync_all()?;
        Ok(())
    }

    fn ftruncate(&self, fd: Fd, len: u64) -> Result<()> {
        let open = self.file(fd, IoType::Truncate)?;
        open.file.set_len(len)?;
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        let local = self.resolve(path)?;
        let metadata = std::fs::metadata(&local).map_err(|e| map_not_found(e, path))?;
        file_stat(&metadata)
    }

    fn truncate(&self, path: &str, len: u64) -> Result<()> {
        let local = self.resolve(path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&local)
            .map_err(|e| map_not_found(e, path))?;
        file.set_len(len)?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<()> {
        let local = self.resolve(path)?;
        std::fs::remove_file(&local).map_err(|e| map_not_found(e, path))
    }
}
