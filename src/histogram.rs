//! Linear histograms stored in an arena.
//!
//! A [`Histogram`] is a [`HistogramHeader`] followed by `num_buckets`
//! counters. Samples are scaled by `samples_per_bucket` and rounded to the
//! nearest bucket. An optional `shift` discards everything below `shift`
//! buckets as underflow and moves the origin of the array up by that much.
//!
//! # Overflow
//!
//! The last bucket holds both real data and overflow weight. A sample whose
//! bucket index `b` is at or past `num_buckets` increments the overflow count
//! and adds `round(b / num_buckets)` to the last bucket, so an outlier twice
//! past the end of the range contributes 2.
//!
//! # Concurrency
//!
//! [`Histogram::input`] must only be called by one thread at a time per
//! histogram. Readers may observe a partially applied sample.

use crate::arena::{Allocation, Arena};
use crate::error::{ProfilerError, Result};
use crate::layout::{HistogramHeader, decode_description};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Immutable configuration of a histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramConfig {
    /// Sample units covered by one bucket (e.g. 1000 for microseconds when
    /// samples are nanoseconds).
    pub samples_per_bucket: u64,
    /// Length of the bucket array, overflow bucket included.
    pub num_buckets: usize,
    /// Buckets below this index are counted as underflow. Zero disables it.
    pub shift: u64,
}

impl HistogramConfig {
    pub fn new(samples_per_bucket: u64, num_buckets: usize) -> Self {
        Self {
            samples_per_bucket,
            num_buckets,
            shift: 0,
        }
    }

    pub fn with_shift(mut self, shift: u64) -> Self {
        self.shift = shift;
        self
    }

    /// Check that samples can be bucketed with this configuration.
    pub fn validate(&self, label: &str) -> Result<()> {
        if self.samples_per_bucket == 0 {
            return Err(ProfilerError::InvalidDeclaration {
                label: label.to_string(),
                reason: "samples per bucket must be non-zero",
            });
        }
        if self.num_buckets == 0 {
            return Err(ProfilerError::InvalidDeclaration {
                label: label.to_string(),
                reason: "bucket count must be non-zero",
            });
        }
        Ok(())
    }
}

/// `round(numerator / denominator)`, halves rounded up, without floating
/// point or intermediate overflow.
#[inline]
pub(crate) fn div_round(numerator: u64, denominator: u64) -> u64 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    quotient + u64::from(remainder >= denominator - denominator / 2)
}

/// Add to a counter that has a single writer.
#[inline]
fn bump(counter: &AtomicU64, by: u64) {
    counter.store(
        counter.load(Ordering::Relaxed).wrapping_add(by),
        Ordering::Relaxed,
    );
}

/// A histogram living in shared memory.
pub struct Histogram {
    record: Allocation<HistogramHeader, AtomicU64>,
}

impl Histogram {
    /// Allocate a zeroed histogram from `arena`.
    pub fn allocate(arena: &Arc<Arena>, config: HistogramConfig, description: &str) -> Result<Self> {
        config.validate(description)?;
        let header = HistogramHeader::new(
            config.samples_per_bucket,
            config.num_buckets as u64,
            config.shift,
            description,
        );
        let record = arena.allocate(header, config.num_buckets)?;
        Ok(Self { record })
    }

    /// Allocate a histogram from `arena` holding a copy of `source`'s current
    /// configuration, aggregates and buckets.
    pub fn allocate_copy(arena: &Arc<Arena>, source: &Histogram, description: &str) -> Result<Self> {
        let copy = Self::allocate(arena, source.config(), description)?;

        let (from, to) = (source.header(), copy.header());
        for (src, dst) in [
            (&from.num_samples, &to.num_samples),
            (&from.sum, &to.sum),
            (&from.min, &to.min),
            (&from.max, &to.max),
            (&from.overflows, &to.overflows),
            (&from.underflows, &to.underflows),
        ] {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        for (src, dst) in source.buckets_raw().iter().zip(copy.buckets_raw()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }

        Ok(copy)
    }

    #[inline]
    fn header(&self) -> &HistogramHeader {
        self.record.header()
    }

    #[inline]
    fn buckets_raw(&self) -> &[AtomicU64] {
        self.record.elements()
    }

    /// Record one sample.
    pub fn input(&self, sample: u64) {
        let header = self.header();
        let buckets = self.buckets_raw();

        if sample > header.max.load(Ordering::Relaxed) {
            header.max.store(sample, Ordering::Relaxed);
        }
        if sample < header.min.load(Ordering::Relaxed) {
            header.min.store(sample, Ordering::Relaxed);
        }
        bump(&header.sum, sample);
        bump(&header.num_samples, 1);

        let mut bucket = div_round(sample, header.samples_per_bucket);
        if header.shift > 0 {
            if bucket < header.shift {
                bump(&header.underflows, 1);
                return;
            }
            bucket -= header.shift;
        }

        let len = buckets.len() as u64;
        if bucket < len {
            bump(&buckets[bucket as usize], 1);
        } else {
            bump(&header.overflows, 1);
            bump(&buckets[buckets.len() - 1], div_round(bucket, len));
        }
    }

    /// Arithmetic mean of all samples, 0 when empty.
    pub fn mean(&self) -> f64 {
        let samples = self.num_samples();
        if samples == 0 {
            return 0.0;
        }
        self.sum() as f64 / samples as f64
    }

    /// Population standard deviation in bucket units, estimated from the
    /// bucket counts around `mean / samples_per_bucket`. 0 when empty.
    pub fn std_deviation(&self) -> f64 {
        let samples = self.num_samples();
        if samples == 0 {
            return 0.0;
        }

        let center = self.mean() / self.samples_per_bucket() as f64;
        let sum: f64 = self
            .buckets_raw()
            .iter()
            .enumerate()
            .map(|(i, count)| {
                let d = i as f64 - center;
                d * d * count.load(Ordering::Relaxed) as f64
            })
            .sum();

        (sum / samples as f64).sqrt()
    }

    /// Smallest bucket index whose cumulative count reaches half the number
    /// of samples (integer division). 0 when empty.
    pub fn median(&self) -> u64 {
        let samples = self.num_samples();
        if samples == 0 {
            return 0;
        }

        let half = samples / 2;
        let mut cumulative = 0u64;
        for (i, count) in self.buckets_raw().iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= half {
                return i as u64;
            }
        }
        0
    }

    pub fn config(&self) -> HistogramConfig {
        let header = self.header();
        HistogramConfig {
            samples_per_bucket: header.samples_per_bucket,
            num_buckets: self.buckets_raw().len(),
            shift: header.shift,
        }
    }

    pub fn samples_per_bucket(&self) -> u64 {
        self.header().samples_per_bucket
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets_raw().len()
    }

    pub fn shift(&self) -> u64 {
        self.header().shift
    }

    pub fn num_samples(&self) -> u64 {
        self.header().num_samples.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.header().sum.load(Ordering::Relaxed)
    }

    /// Smallest sample seen, 0 when empty.
    pub fn min(&self) -> u64 {
        if self.num_samples() == 0 {
            return 0;
        }
        self.header().min.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.header().max.load(Ordering::Relaxed)
    }

    pub fn overflows(&self) -> u64 {
        self.header().overflows.load(Ordering::Relaxed)
    }

    pub fn underflows(&self) -> u64 {
        self.header().underflows.load(Ordering::Relaxed)
    }

    /// Count in bucket `index`, or `None` past the end.
    pub fn bucket(&self, index: usize) -> Option<u64> {
        self.buckets_raw()
            .get(index)
            .map(|count| count.load(Ordering::Relaxed))
    }

    /// Snapshot of every bucket.
    pub fn buckets(&self) -> Vec<u64> {
        self.buckets_raw()
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect()
    }

    /// The description stored in the record header.
    pub fn description(&self) -> String {
        decode_description(&self.header().description)
    }

    /// Byte offset of this record in its arena.
    pub fn offset(&self) -> usize {
        self.record.offset()
    }

    pub(crate) fn arena(&self) -> &Arc<Arena> {
        self.record.arena()
    }

    /// One-line summary used as the report header for this histogram.
    pub fn summary(&self, name: &str) -> String {
        let mut line = format!(
            "{name}, #buckets: {}, #samples: {}",
            self.num_buckets(),
            self.num_samples()
        );
        if self.shift() > 0 {
            line.push_str(&format!(", shift: {}", self.shift()));
        }
        line.push_str(&format!(
            ", #overflows: {}, #underflows: {}, samples/bucket: {}, mean: {:.3}, std: {:.3}, median: {}, min: {}, max: {}",
            self.overflows(),
            self.underflows(),
            self.samples_per_bucket(),
            self.mean(),
            self.std_deviation(),
            self.median(),
            self.min(),
            self.max()
        ));
        line
    }
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Histogram")
            .field("config", &self.config())
            .field("num_samples", &self.num_samples())
            .field("offset", &self.offset())
            .finish()
    }
}
