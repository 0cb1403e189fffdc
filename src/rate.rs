//! Sliding-window event counters.
//!
//! A [`RateCounter`] divides wall-clock time into `nanos_per_bucket` slices
//! and maps them onto a circular array of `num_buckets` counters. Only the
//! bucket for the current slice is incremented; older buckets keep stale
//! counts until the window wraps around to them again. Readers work out the
//! age of each bucket from `current_index`.

use crate::arena::{Allocation, Arena};
use crate::error::{ProfilerError, Result};
use crate::layout::{RateCounterHeader, decode_description};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Check a rate counter's shape. Used by every path that accepts one.
pub(crate) fn validate(label: &str, nanos_per_bucket: u64, num_buckets: usize) -> Result<()> {
    let reason = if nanos_per_bucket == 0 {
        "nanoseconds per bucket must be non-zero"
    } else if num_buckets == 0 {
        "bucket count must be non-zero"
    } else {
        return Ok(());
    };
    Err(ProfilerError::InvalidDeclaration {
        label: label.to_string(),
        reason,
    })
}

/// A rate counter living in shared memory.
pub struct RateCounter {
    record: Allocation<RateCounterHeader, AtomicU64>,
}

impl RateCounter {
    /// Allocate a zeroed rate counter from `arena`.
    pub fn allocate(
        arena: &Arc<Arena>,
        nanos_per_bucket: u64,
        num_buckets: usize,
        description: &str,
    ) -> Result<Self> {
        validate(description, nanos_per_bucket, num_buckets)?;

        let header = RateCounterHeader::new(nanos_per_bucket, num_buckets as u64, description);
        let record = arena.allocate(header, num_buckets)?;
        Ok(Self { record })
    }

    /// Add `count` events to the bucket for the current wall-clock time.
    pub fn sample(&self, count: u64) {
        // A clock before the epoch lands in bucket 0 rather than failing.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.sample_at(nanos, count);
    }

    /// Add `count` events to the bucket for `nanos` since the epoch.
    pub fn sample_at(&self, nanos: u64, count: u64) {
        let header = self.record.header();
        let buckets = self.record.elements();

        let index = (nanos / header.nanos_per_bucket) % buckets.len() as u64;
        let bucket = &buckets[index as usize];
        // single writer
        bucket.store(
            bucket.load(Ordering::Relaxed).wrapping_add(count),
            Ordering::Relaxed,
        );
        header.current_index.store(index, Ordering::Relaxed);
    }

    pub fn nanos_per_bucket(&self) -> u64 {
        self.record.header().nanos_per_bucket
    }

    pub fn num_buckets(&self) -> usize {
        self.record.elements().len()
    }

    /// Index of the bucket written most recently.
    pub fn current_index(&self) -> usize {
        self.record.header().current_index.load(Ordering::Relaxed) as usize
    }

    /// Snapshot of every bucket, in array order.
    pub fn buckets(&self) -> Vec<u64> {
        self.record
            .elements()
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect()
    }

    pub fn description(&self) -> String {
        decode_description(&self.record.header().description)
    }

    /// Byte offset of this record in its arena.
    pub fn offset(&self) -> usize {
        self.record.offset()
    }
}

impl std::fmt::Debug for RateCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateCounter")
            .field("nanos_per_bucket", &self.nanos_per_bucket())
            .field("num_buckets", &self.num_buckets())
            .field("current_index", &self.current_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: u64 = 1_000_000_000;

    fn counter(nanos_per_bucket: u64, num_buckets: usize) -> RateCounter {
        let arena = Arena::create(
            None,
            Arena::reservation::<RateCounterHeader, AtomicU64>(num_buckets).unwrap(),
        )
        .unwrap();
        RateCounter::allocate(&arena, nanos_per_bucket, num_buckets, "requests").unwrap()
    }

    #[test]
    fn test_sample_at_indexes_by_time() {
        let c = counter(SECOND, 4);
        c.sample_at(0, 1);
        c.sample_at(SECOND / 2, 2);
        assert_eq!(c.buckets(), vec![3, 0, 0, 0]);
        assert_eq!(c.current_index(), 0);

        c.sample_at(3 * SECOND, 5);
        assert_eq!(c.buckets(), vec![3, 0, 0, 5]);
        assert_eq!(c.current_index(), 3);
    }

    #[test]
    fn test_window_wraps_without_clearing() {
        let c = counter(SECOND, 4);
        c.sample_at(SECOND, 1);
        // five seconds later maps onto the same bucket again
        c.sample_at(5 * SECOND, 1);
        assert_eq!(c.buckets(), vec![0, 2, 0, 0]);
        assert_eq!(c.current_index(), 1);
    }

    #[test]
    fn test_sample_uses_wall_clock() {
        let c = counter(SECOND, 60);
        c.sample(1);
        c.sample(1);
        let total: u64 = c.buckets().iter().sum();
        assert_eq!(total, 2);
        assert!(c.buckets()[c.current_index()] >= 1);
    }

    #[test]
    fn test_metadata() {
        let c = counter(SECOND, 8);
        assert_eq!(c.nanos_per_bucket(), SECOND);
        assert_eq!(c.num_buckets(), 8);
        assert_eq!(c.description(), "requests");
    }

    #[test]
    fn test_invalid_configuration() {
        let arena = Arena::create(None, 4 * 4096).unwrap();
        assert!(matches!(
            RateCounter::allocate(&arena, 0, 8, "r"),
            Err(ProfilerError::InvalidDeclaration { .. })
        ));
        assert!(matches!(
            RateCounter::allocate(&arena, SECOND, 0, "r"),
            Err(ProfilerError::InvalidDeclaration { .. })
        ));
    }
}
