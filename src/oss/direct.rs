//! Unbuffered storage-object file

use std::sync::Arc;

use tracing::{debug, warn};

use super::{IoVec, OssFile};
use crate::aio::{AioRead, AioWrite};
use crate::config::{CoalescePolicy, DEFAULT_MAX_SPAN};
use crate::error::{Error, Result};
use crate::readv::{Extent, ExtentCoalescer, ExtentHolder};
use crate::store::{checked_end, FileStat, Fd, ObjectStore, OpenFlags};

/// Largest span a readv group is fetched with in one transport read.
pub const MAX_GROUP_SPAN: u64 = DEFAULT_MAX_SPAN;

/// File whose every operation goes straight to the store.
pub struct DirectFile {
    store: Arc<dyn ObjectStore>,
    coalescer: ExtentCoalescer,
    fd: Option<Fd>,
}

impl std::fmt::Debug for DirectFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectFile")
            .field("store", &self.store.name())
            .field("coalescer", &self.coalescer)
            .field("fd", &self.fd)
            .finish()
    }
}

impl DirectFile {
    pub fn new(store: Arc<dyn ObjectStore>, readv: CoalescePolicy) -> Self {
        Self {
            store,
            coalescer: ExtentCoalescer::new(readv),
            fd: None,
        }
    }

    fn require_fd(&self) -> Result<Fd> {
        self.fd.ok_or(Error::NotOpen)
    }

    /// Serve one coalesced group with a single read over its span.
    ///
    /// A group spanning more than [`MAX_GROUP_SPAN`] is read one extent at a
    /// time straight into the caller's buffers instead.
    fn read_group(&self, fd: Fd, group: &ExtentHolder, iov: &mut [IoVec<'_>]) -> Result<usize> {
        let begin = group.begin();
        let span = group.span();
        if span > MAX_GROUP_SPAN {
            return self.read_extents(fd, iov);
        }

        let mut scratch = vec![0u8; span as usize];
        let filled = if scratch.is_empty() {
            0
        } else {
            self.store.pread(fd, &mut scratch, begin)?
        };

        let mut total = 0;
        for (extent, vec) in group.extents().iter().zip(iov.iter_mut()) {
            let start = (extent.begin - begin) as usize;
            let end = (start + extent.len as usize).min(filled);
            if start < end {
                vec.buf[..end - start].copy_from_slice(&scratch[start..end]);
                total += end - start;
            }
        }
        debug!(
            fd = %fd,
            offset = begin,
            span,
            extents = group.count(),
            rc = filled,
            "readv group"
        );
        Ok(total)
    }

    fn read_extents(&self, fd: Fd, iov: &mut [IoVec<'_>]) -> Result<usize> {
        let mut total = 0;
        for vec in iov.iter_mut().filter(|v| !v.buf.is_empty()) {
            total += self.store.pread(fd, &mut vec.buf[..], vec.offset)?;
        }
        debug!(fd = %fd, extents = iov.len(), rc = total, "readv sparse group");
        Ok(total)
    }
}

impl OssFile for DirectFile {
    fn open(&mut self, path: &str, flags: OpenFlags) -> Result<Fd> {
        if let Some(fd) = self.fd {
            return Err(Error::InvalidArgument(format!(
                "file already open as fd {fd}"
            )));
        }
        let fd = self.store.open(path, flags)?;
        self.fd = Some(fd);
        Ok(fd)
    }

    fn close(&mut self) -> Result<()> {
        let fd = self.fd.take().ok_or(Error::NotOpen)?;
        self.store.close(fd)
    }

    fn fd(&self) -> Option<Fd> {
        self.fd
    }

    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let fd = self.require_fd()?;
        checked_end(offset, buf.len())?;
        self.store.pread(fd, buf, offset)
    }

    fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let fd = self.require_fd()?;
        checked_end(offset, buf.len())?;
        self.store.pwrite(fd, buf, offset)
    }

    fn read_aio(&self, req: AioRead) -> Result<()> {
        let fd = self.require_fd()?;
        checked_end(req.offset, req.len)?;
        self.store.submit_read(fd, req.offset, req.len, req.done)
    }

    fn write_aio(&self, req: AioWrite) -> Result<()> {
        let fd = self.require_fd()?;
        checked_end(req.offset, req.data.len())?;
        self.store.submit_write(fd, req.offset, req.data, req.done)
    }

    fn read_raw(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read(buf, offset)
    }

    fn readv(&self, iov: &mut [IoVec<'_>]) -> Result<usize> {
        let fd = self.require_fd()?;
        for v in iov.iter() {
            checked_end(v.offset, v.buf.len())?;
        }
        let extents: ExtentHolder = iov
            .iter()
            .map(|v| Extent::new(v.offset, v.buf.len() as u64))
            .collect();

        let mut total = 0;
        let mut next = 0;
        for group in self.coalescer.convert(&extents) {
            let count = group.count();
            total += self.read_group(fd, &group, &mut iov[next..next + count])?;
            next += count;
        }
        Ok(total)
    }

    fn fstat(&self) -> Result<FileStat> {
        self.store.fstat(self.require_fd()?)
    }

    fn fsync(&self) -> Result<()> {
        self.store.fsync(self.require_fd()?)
    }

    fn ftruncate(&self, len: u64) -> Result<()> {
        self.store.ftruncate(self.require_fd()?, len)
    }
}

impl Drop for DirectFile {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            if let Err(e) = self.store.close(fd) {
                warn!(fd = %fd, error = %e, "failed to close dropped file");
            }
        }
    }
}
