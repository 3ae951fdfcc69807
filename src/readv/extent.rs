//! Extents and ordered extent groups

use serde::{Deserialize, Serialize};

/// A contiguous byte range of a file requested by a vectored read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub begin: u64,
    pub len: u64,
}

impl Extent {
    pub fn new(begin: u64, len: u64) -> Self {
        Self { begin, len }
    }

    /// One past the last byte, clamped to `u64::MAX`.
    #[inline]
    pub fn end(&self) -> u64 {
        self.begin.saturating_add(self.len)
    }
}

/// An ordered sequence of extents, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentHolder {
    extents: Vec<Extent>,
}

impl ExtentHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            extents: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, extent: Extent) {
        self.extents.push(extent);
    }

    pub fn count(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Lowest starting offset, 0 when empty.
    pub fn begin(&self) -> u64 {
        self.extents.iter().map(|e| e.begin).min().unwrap_or(0)
    }

    /// Highest end offset, 0 when empty.
    pub fn end(&self) -> u64 {
        self.extents.iter().map(Extent::end).max().unwrap_or(0)
    }

    /// Distance from `begin` to `end`.
    pub fn span(&self) -> u64 {
        self.end() - self.begin()
    }

    /// Sum of extent lengths (overlaps counted twice).
    pub fn bytes_contained(&self) -> u64 {
        self.extents.iter().map(|e| e.len).sum()
    }
}

impl FromIterator<Extent> for ExtentHolder {
    fn from_iter<I: IntoIterator<Item = Extent>>(iter: I) -> Self {
        Self {
            extents: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ExtentHolder {
    type Item = Extent;
    type IntoIter = std::vec::IntoIter<Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.extents.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_holder() {
        let holder = ExtentHolder::new();
        assert!(holder.is_empty());
        assert_eq!(holder.span(), 0);
        assert_eq!(holder.bytes_contained(), 0);
    }

    #[test]
    fn test_unordered_bounds() {
        let holder: ExtentHolder = [Extent::new(100, 10), Extent::new(20, 5), Extent::new(50, 60)]
            .into_iter()
            .collect();
        assert_eq!(holder.count(), 3);
        assert_eq!(holder.begin(), 20);
        assert_eq!(holder.end(), 110);
        assert_eq!(holder.span(), 90);
        assert_eq!(holder.bytes_contained(), 75);
        // Insertion order is kept
        assert_eq!(holder.extents()[0], Extent::new(100, 10));
    }
}
