//! Extent coalescing
//!
//! Splits the extents of one vectored read into groups, each of which the
//! file layer serves with a single transport read covering the group's span.
//! Both policies walk the input once, in order, and only ever close the
//! current group and open the next one, so the groups concatenate back to
//! exactly the input.

use super::extent::{Extent, ExtentHolder};
use crate::config::CoalescePolicy;

/// Stateless grouping of extents under a [`CoalescePolicy`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtentCoalescer {
    policy: CoalescePolicy,
}

impl Default for ExtentCoalescer {
    fn default() -> Self {
        Self::new(CoalescePolicy::default())
    }
}

impl ExtentCoalescer {
    pub fn new(policy: CoalescePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> CoalescePolicy {
        self.policy
    }

    /// Partition `extents` into ordered groups.
    pub fn convert(&self, extents: &ExtentHolder) -> Vec<ExtentHolder> {
        match self.policy {
            CoalescePolicy::FixedCount { max_extents } => {
                fixed_count(extents.extents(), max_extents.max(1))
            }
            CoalescePolicy::Density {
                min_span,
                max_span,
                min_density,
            } => density(extents.extents(), min_span, max_span, min_density),
        }
    }
}

fn fixed_count(extents: &[Extent], max_extents: usize) -> Vec<ExtentHolder> {
    extents
        .chunks(max_extents)
        .map(|chunk| chunk.iter().copied().collect())
        .collect()
}

fn density(
    extents: &[Extent],
    min_span: u64,
    max_span: u64,
    min_density: f64,
) -> Vec<ExtentHolder> {
    let mut groups = Vec::new();
    let mut current = ExtentHolder::new();

    for &extent in extents {
        if !current.is_empty() && !accepts(&current, extent, min_span, max_span, min_density) {
            groups.push(std::mem::take(&mut current));
        }
        current.push(extent);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Whether `group` may grow by `next`.
fn accepts(
    group: &ExtentHolder,
    next: Extent,
    min_span: u64,
    max_span: u64,
    min_density: f64,
) -> bool {
    let begin = group.begin().min(next.begin);
    let end = group.end().max(next.end());
    let span = end - begin;

    if span < min_span {
        return true;
    }
    if span >= max_span {
        return false;
    }
    if span == 0 {
        return true;
    }
    let contained = group.bytes_contained() + next.len;
    contained as f64 / span as f64 > min_density
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential(n: usize, len: u64, gap: u64) -> ExtentHolder {
        (0..n as u64)
            .map(|i| Extent::new(i * (len + gap), len))
            .collect()
    }

    fn counts(groups: &[ExtentHolder]) -> Vec<usize> {
        groups.iter().map(ExtentHolder::count).collect()
    }

    #[test]
    fn test_fixed_count_23_by_10() {
        let coalescer = ExtentCoalescer::default();
        let groups = coalescer.convert(&sequential(23, 100, 50));
        assert_eq!(counts(&groups), vec![10, 10, 3]);
    }

    #[test]
    fn test_fixed_count_exact_multiple() {
        let coalescer = ExtentCoalescer::new(CoalescePolicy::FixedCount { max_extents: 5 });
        assert_eq!(counts(&coalescer.convert(&sequential(10, 1, 0))), vec![5, 5]);
    }

    #[test]
    fn test_fixed_count_zero_treated_as_one() {
        let coalescer = ExtentCoalescer::new(CoalescePolicy::FixedCount { max_extents: 0 });
        assert_eq!(counts(&coalescer.convert(&sequential(3, 1, 0))), vec![1, 1, 1]);
    }

    #[test]
    fn test_empty_input() {
        assert!(ExtentCoalescer::default().convert(&ExtentHolder::new()).is_empty());
        assert!(ExtentCoalescer::new(CoalescePolicy::density())
            .convert(&ExtentHolder::new())
            .is_empty());
    }

    #[test]
    fn test_density_merges_dense_runs() {
        let coalescer = ExtentCoalescer::new(CoalescePolicy::density());
        // Touching extents: density 1.0 throughout
        let groups = coalescer.convert(&sequential(50, 4096, 0));
        assert_eq!(counts(&groups), vec![50]);
    }

    #[test]
    fn test_density_breaks_on_sparse_gap() {
        let coalescer = ExtentCoalescer::new(CoalescePolicy::density());
        let input: ExtentHolder = [
            Extent::new(0, 100),
            Extent::new(100, 100),
            // Far away: density collapses
            Extent::new(1_000_000, 100),
            Extent::new(1_000_100, 100),
        ]
        .into_iter()
        .collect();
        assert_eq!(counts(&coalescer.convert(&input)), vec![2, 2]);
    }

    #[test]
    fn test_density_min_span_forces_merge() {
        let coalescer = ExtentCoalescer::new(CoalescePolicy::Density {
            min_span: 1_000_000,
            max_span: 16 << 20,
            min_density: 0.6,
        });
        let input: ExtentHolder = [Extent::new(0, 10), Extent::new(500_000, 10)]
            .into_iter()
            .collect();
        assert_eq!(counts(&coalescer.convert(&input)), vec![2]);
    }

    #[test]
    fn test_density_max_span_caps_group() {
        let coalescer = ExtentCoalescer::new(CoalescePolicy::Density {
            min_span: 0,
            max_span: 1000,
            min_density: 0.0,
        });
        let groups = coalescer.convert(&sequential(10, 300, 0));
        assert!(groups.iter().all(|g| g.span() < 1000));
        assert_eq!(counts(&groups), vec![3, 3, 3, 1]);
    }
}
