//! Staging buffer
//!
//! One fixed-capacity byte region per open file plus the metadata describing
//! which file range, if any, it currently mirrors. The buffer knows nothing
//! about I/O: adapters fill and drain it, the algorithm decides when.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Buffer shared between the algorithm and in-flight completions.
pub type SharedBuffer = Arc<Mutex<BufferData>>;

/// A fixed-capacity staging region.
///
/// When `valid` is set, the first `len` bytes of the region are the
/// authoritative image of the file range starting at `starting_offset`.
#[derive(Debug)]
pub struct BufferData {
    data: Vec<u8>,
    len: usize,
    starting_offset: u64,
    valid: bool,
}

impl BufferData {
    /// Allocate a zeroed region of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(
                "buffer capacity must be non-zero".into(),
            ));
        }

        Ok(Self {
            data: vec![0u8; capacity],
            len: 0,
            starting_offset: 0,
            valid: false,
        })
    }

    /// Wrap in a shared handle.
    pub fn into_shared(self) -> SharedBuffer {
        Arc::new(Mutex::new(self))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn starting_offset(&self) -> u64 {
        self.starting_offset
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// File offset one past the last byte held.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.starting_offset.saturating_add(self.len as u64)
    }

    /// The whole storage region.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    /// The whole storage region, mutably.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the number of meaningful bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `len` exceeds the capacity.
    pub fn set_length(&mut self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(Error::InvalidArgument(format!(
                "length {} exceeds buffer capacity {}",
                len,
                self.capacity()
            )));
        }
        self.len = len;
        Ok(())
    }

    pub fn set_starting_offset(&mut self, offset: u64) {
        self.starting_offset = offset;
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Forget the cached image.
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.len = 0;
    }

    /// Whether `[offset, offset + len)` lies entirely inside a valid image.
    pub fn covers(&self, offset: u64, len: usize) -> bool {
        self.valid
            && offset >= self.starting_offset
            && offset
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.end_offset())
    }

    /// Copy the cached bytes starting at `offset` into `dst`.
    ///
    /// Only the part of `dst` that overlaps a valid image is written, and
    /// only if the image contains `offset` itself. Returns the bytes copied.
    pub fn copy_out(&self, offset: u64, dst: &mut [u8]) -> usize {
        if !self.valid || offset < self.starting_offset || offset >= self.end_offset() {
            return 0;
        }
        let start = (offset - self.starting_offset) as usize;
        let n = dst.len().min(self.len - start);
        dst[..n].copy_from_slice(&self.data[start..start + n]);
        n
    }
}
