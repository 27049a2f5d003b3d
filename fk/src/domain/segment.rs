//! Execution segments: half-open intervals of the load space
//!
//! A scheduling decision over `n` slaves partitions `[0, 1)` into `n`
//! pairwise-disjoint segments whose union is the whole interval. Each
//! segment also determines integer VU and iteration shares that sum
//! exactly to the totals across a partition.

use serde::{Deserialize, Serialize};

/// A half-open interval `[start, end)` of the load space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSegment {
    pub start: f64,
    pub end: f64,
}

impl ExecutionSegment {
    /// The full load space `[0, 1)`
    pub fn full() -> Self {
        Self { start: 0.0, end: 1.0 }
    }

    /// Construct a checked segment; `start` must be < `end` within `[0, 1]`
    pub fn new(start: f64, end: f64) -> Option<Self> {
        if (0.0..1.0).contains(&start) && start < end && end <= 1.0 {
            Some(Self { start, end })
        } else {
            None
        }
    }

    pub fn length(&self) -> f64 {
        self.end - self.start
    }

    /// Integer share of `total` falling into this segment
    ///
    /// Computed as `floor(end * total) - floor(start * total)` so that the
    /// shares of a partition sum exactly to `total`.
    pub fn share_of(&self, total: u64) -> u64 {
        let hi = (self.end * total as f64).floor() as u64;
        let lo = (self.start * total as f64).floor() as u64;
        hi.saturating_sub(lo)
    }

    /// VU count allocated to this segment out of `total_vus`
    pub fn vus_of(&self, total_vus: u32) -> u32 {
        self.share_of(u64::from(total_vus)) as u32
    }

    /// Iteration subrange `[lo, hi)` of a shared-iterations total
    pub fn iteration_range(&self, total_iterations: u64) -> (u64, u64) {
        let lo = (self.start * total_iterations as f64).floor() as u64;
        let hi = (self.end * total_iterations as f64).floor() as u64;
        (lo, hi)
    }

    /// Partition `[0, 1)` proportionally to the given weights
    ///
    /// Entries with zero weight receive no segment. The caller is expected
    /// to pass entries in a stable order (the scheduler sorts by slave id)
    /// so partitions are deterministic.
    pub fn partition(weights: &[u64]) -> Vec<Option<ExecutionSegment>> {
        let total: u64 = weights.iter().sum();
        if total == 0 {
            return weights.iter().map(|_| None).collect();
        }

        let mut out = Vec::with_capacity(weights.len());
        let mut acc: u64 = 0;
        for &w in weights {
            if w == 0 {
                out.push(None);
                continue;
            }
            let start = acc as f64 / total as f64;
            acc += w;
            let end = if acc == total { 1.0 } else { acc as f64 / total as f64 };
            out.push(Some(ExecutionSegment { start, end }));
        }
        out
    }
}

impl std::fmt::Display for ExecutionSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:.4}, {:.4})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_rejects_degenerate() {
        assert!(ExecutionSegment::new(0.0, 0.0).is_none());
        assert!(ExecutionSegment::new(0.5, 0.4).is_none());
        assert!(ExecutionSegment::new(-0.1, 0.5).is_none());
        assert!(ExecutionSegment::new(0.0, 1.1).is_none());
        assert!(ExecutionSegment::new(0.0, 1.0).is_some());
    }

    #[test]
    fn test_partition_two_slaves() {
        // maxVUs 4 and 6 -> [0, 0.4) and [0.4, 1.0)
        let segs = ExecutionSegment::partition(&[4, 6]);
        let a = segs[0].unwrap();
        let b = segs[1].unwrap();
        assert!((a.start - 0.0).abs() < 1e-9 && (a.end - 0.4).abs() < 1e-9);
        assert!((b.start - 0.4).abs() < 1e-9 && (b.end - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_iteration_ranges_cover_total() {
        let segs = ExecutionSegment::partition(&[4, 6]);
        let (a_lo, a_hi) = segs[0].unwrap().iteration_range(100);
        let (b_lo, b_hi) = segs[1].unwrap().iteration_range(100);
        assert_eq!((a_lo, a_hi), (0, 40));
        assert_eq!((b_lo, b_hi), (40, 100));
    }

    #[test]
    fn test_vus_split_exactly() {
        let segs = ExecutionSegment::partition(&[4, 6]);
        assert_eq!(segs[0].unwrap().vus_of(10), 4);
        assert_eq!(segs[1].unwrap().vus_of(10), 6);
    }

    #[test]
    fn test_partition_skips_zero_weights() {
        let segs = ExecutionSegment::partition(&[3, 0, 1]);
        assert!(segs[0].is_some());
        assert!(segs[1].is_none());
        assert!(segs[2].is_some());
        assert!((segs[2].unwrap().end - 1.0).abs() < 1e-9);
    }

    proptest! {
        /// Partition segments are pairwise disjoint, ordered, and cover [0, 1)
        #[test]
        fn prop_partition_is_disjoint_cover(weights in proptest::collection::vec(1u64..100, 1..12)) {
            let segs: Vec<_> = ExecutionSegment::partition(&weights).into_iter().flatten().collect();
            prop_assert_eq!(segs.len(), weights.len());
            prop_assert!((segs[0].start - 0.0).abs() < 1e-12);
            prop_assert!((segs[segs.len() - 1].end - 1.0).abs() < 1e-12);
            for pair in segs.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start + 1e-12);
                prop_assert!((pair[0].end - pair[1].start).abs() < 1e-12);
            }
            for s in &segs {
                prop_assert!(s.start < s.end);
            }
        }

        /// Integer shares sum exactly to the total
        #[test]
        fn prop_shares_sum_to_total(
            weights in proptest::collection::vec(1u64..50, 1..10),
            total in 1u64..10_000,
        ) {
            let segs: Vec<_> = ExecutionSegment::partition(&weights).into_iter().flatten().collect();
            let sum: u64 = segs.iter().map(|s| s.share_of(total)).sum();
            prop_assert_eq!(sum, total);
        }

        /// Iteration ranges are contiguous and cover [0, total)
        #[test]
        fn prop_iteration_ranges_contiguous(
            weights in proptest::collection::vec(1u64..50, 1..10),
            total in 1u64..10_000,
        ) {
            let segs: Vec<_> = ExecutionSegment::partition(&weights).into_iter().flatten().collect();
            let mut cursor = 0u64;
            for s in &segs {
                let (lo, hi) = s.iteration_range(total);
                prop_assert_eq!(lo, cursor);
                cursor = hi;
            }
            prop_assert_eq!(cursor, total);
        }
    }
}
