//! Reading records back out of an arena file.
//!
//! This decoder depends only on the byte layout documented in
//! [`crate::layout`], never on the writer's in-memory types, so it works on a
//! file left behind by a crashed process as well as on a live one.

use crate::error::{ProfilerError, Result};
use crate::layout::{
    DESCRIPTION_LEN, HISTOGRAM_MAGIC, HistogramHeader, PAGE_SIZE, RATE_COUNTER_MAGIC,
    RateCounterHeader, decode_description,
};
use memmap2::Mmap;
use std::fs::File;
use std::mem::{offset_of, size_of};
use std::path::Path;

/// A decoded histogram record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramRecord {
    /// Byte offset of the header in the file.
    pub offset: usize,
    pub samples_per_bucket: u64,
    pub num_buckets: u64,
    pub shift: u64,
    pub num_samples: u64,
    pub sum: u64,
    /// `u64::MAX` until the first sample.
    pub min: u64,
    pub max: u64,
    pub overflows: u64,
    pub underflows: u64,
    pub description: String,
    pub buckets: Vec<u64>,
}

/// A decoded rate counter record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateCounterRecord {
    pub offset: usize,
    pub nanos_per_bucket: u64,
    pub num_buckets: u64,
    pub current_index: u64,
    pub description: String,
    pub buckets: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Histogram(HistogramRecord),
    RateCounter(RateCounterRecord),
}

impl Record {
    pub fn description(&self) -> &str {
        match self {
            Record::Histogram(h) => &h.description,
            Record::RateCounter(r) => &r.description,
        }
    }

    pub fn buckets(&self) -> &[u64] {
        match self {
            Record::Histogram(h) => &h.buckets,
            Record::RateCounter(r) => &r.buckets,
        }
    }
}

/// Every record found in one arena.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: Vec<Record>,
}

impl Snapshot {
    /// Map the file at `path` read-only and decode it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::default());
        }

        // SAFETY: the mapping is only read through byte copies. A concurrent
        // writer may change values underneath, which yields a torn but
        // memory-safe snapshot.
        let map = unsafe { Mmap::map(&file)? };
        let snapshot = Self::from_bytes(&map)?;

        tracing::debug!(path = ?path, records = snapshot.records.len(), "read snapshot");
        Ok(snapshot)
    }

    /// Decode records from the start of `bytes` until a zero magic or the
    /// end of the buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut records = Vec::new();
        let mut offset = 0;

        while offset + size_of::<u64>() <= bytes.len() {
            let (record, end) = match read_u64(bytes, offset) {
                0 => break,
                HISTOGRAM_MAGIC => decode_histogram(bytes, offset)?,
                RATE_COUNTER_MAGIC => decode_rate_counter(bytes, offset)?,
                magic => return Err(ProfilerError::UnknownMagic(magic)),
            };
            records.push(record);
            offset = end.next_multiple_of(PAGE_SIZE);
        }

        Ok(Self { records })
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn histograms(&self) -> impl Iterator<Item = &HistogramRecord> {
        self.records.iter().filter_map(|record| match record {
            Record::Histogram(h) => Some(h),
            Record::RateCounter(_) => None,
        })
    }

    pub fn rate_counters(&self) -> impl Iterator<Item = &RateCounterRecord> {
        self.records.iter().filter_map(|record| match record {
            Record::RateCounter(r) => Some(r),
            Record::Histogram(_) => None,
        })
    }

    /// The first histogram whose description is `description`.
    pub fn histogram(&self, description: &str) -> Option<&HistogramRecord> {
        self.histograms().find(|h| h.description == description)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[inline]
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(buf)
}

/// Check that `len` bytes starting at `at` are present.
fn require(bytes: &[u8], record: usize, at: usize, len: usize) -> Result<usize> {
    at.checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or(ProfilerError::Truncated { offset: record })
}

/// Read `count` buckets that start right after a page-sized header.
fn read_buckets(bytes: &[u8], record: usize, count: u64) -> Result<(Vec<u64>, usize)> {
    let start = record + PAGE_SIZE;
    let len = usize::try_from(count)
        .ok()
        .and_then(|count| count.checked_mul(size_of::<u64>()))
        .ok_or(ProfilerError::Truncated { offset: record })?;
    let end = require(bytes, record, start, len)?;

    let buckets = (start..end)
        .step_by(size_of::<u64>())
        .map(|at| read_u64(bytes, at))
        .collect();
    Ok((buckets, end))
}

fn description(bytes: &[u8], at: usize) -> String {
    decode_description(&bytes[at..at + DESCRIPTION_LEN])
}

fn decode_histogram(bytes: &[u8], offset: usize) -> Result<(Record, usize)> {
    require(bytes, offset, offset, size_of::<HistogramHeader>())?;
    let field = |at: usize| read_u64(bytes, offset + at);

    let num_buckets = field(offset_of!(HistogramHeader, num_buckets));
    let (buckets, end) = read_buckets(bytes, offset, num_buckets)?;

    let record = HistogramRecord {
        offset,
        samples_per_bucket: field(offset_of!(HistogramHeader, samples_per_bucket)),
        num_buckets,
        shift: field(offset_of!(HistogramHeader, shift)),
        num_samples: field(offset_of!(HistogramHeader, num_samples)),
        sum: field(offset_of!(HistogramHeader, sum)),
        min: field(offset_of!(HistogramHeader, min)),
        max: field(offset_of!(HistogramHeader, max)),
        overflows: field(offset_of!(HistogramHeader, overflows)),
        underflows: field(offset_of!(HistogramHeader, underflows)),
        description: description(bytes, offset + offset_of!(HistogramHeader, description)),
        buckets,
    };
    Ok((Record::Histogram(record), end))
}

fn decode_rate_counter(bytes: &[u8], offset: usize) -> Result<(Record, usize)> {
    require(bytes, offset, offset, size_of::<RateCounterHeader>())?;
    let field = |at: usize| read_u64(bytes, offset + at);

    let num_buckets = field(offset_of!(RateCounterHeader, num_buckets));
    let (buckets, end) = read_buckets(bytes, offset, num_buckets)?;

    let record = RateCounterRecord {
        offset,
        nanos_per_bucket: field(offset_of!(RateCounterHeader, nanos_per_bucket)),
        num_buckets,
        current_index: field(offset_of!(RateCounterHeader, current_index)),
        description: description(bytes, offset + offset_of!(RateCounterHeader, description)),
        buckets,
    };
    Ok((Record::RateCounter(record), end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::histogram::{Histogram, HistogramConfig};
    use crate::rate::RateCounter;
    use crate::layout::RateCounterHeader;
    use std::sync::atomic::AtomicU64;
    use tempfile::tempdir;

    #[test]
    fn test_decode_mixed_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.shm");
        let size = Arena::reservation::<HistogramHeader, AtomicU64>(3).unwrap()
            + Arena::reservation::<RateCounterHeader, AtomicU64>(4).unwrap();

        let arena = Arena::create(Some(&path), size).unwrap();
        let h = Histogram::allocate(&arena, HistogramConfig::new(10, 3).with_shift(1), "h").unwrap();
        let r = RateCounter::allocate(&arena, 100, 4, "r").unwrap();
        h.input(5);
        h.input(21);
        h.input(100);
        r.sample_at(250, 7);

        // shared mapping: the page cache already holds the writes
        let bytes = std::fs::read(&path).unwrap();
        let snapshot = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(snapshot.len(), 2);

        let hist = snapshot.histogram("h").unwrap();
        assert_eq!(hist.offset, h.offset());
        assert_eq!(hist.samples_per_bucket, 10);
        assert_eq!(hist.num_buckets, 3);
        assert_eq!(hist.shift, 1);
        assert_eq!(hist.num_samples, 3);
        assert_eq!(hist.sum, 126);
        assert_eq!(hist.min, 5);
        assert_eq!(hist.max, 100);
        assert_eq!(hist.overflows, h.overflows());
        assert_eq!(hist.underflows, 0);
        assert_eq!(hist.buckets, h.buckets());

        let rate = snapshot.rate_counters().next().unwrap();
        assert_eq!(rate.offset, r.offset());
        assert_eq!(rate.nanos_per_bucket, 100);
        assert_eq!(rate.current_index, 2);
        assert_eq!(rate.buckets, vec![0, 0, 7, 0]);
        assert_eq!(snapshot.records()[1].description(), "r");
    }

    #[test]
    fn test_empty_bytes() {
        assert!(Snapshot::from_bytes(&[]).unwrap().is_empty());
        assert!(Snapshot::from_bytes(&[0u8; PAGE_SIZE]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_magic() {
        let mut bytes = vec![0u8; PAGE_SIZE];
        bytes[..8].copy_from_slice(&0xdead_beef_u64.to_ne_bytes());
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(ProfilerError::UnknownMagic(0xdead_beef))
        ));
    }

    #[test]
    fn test_truncated_header() {
        let mut bytes = vec![0u8; 64];
        bytes[..8].copy_from_slice(&HISTOGRAM_MAGIC.to_ne_bytes());
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(ProfilerError::Truncated { offset: 0 })
        ));
    }

    #[test]
    fn test_truncated_buckets() {
        let mut bytes = vec![0u8; PAGE_SIZE + 16];
        bytes[..8].copy_from_slice(&HISTOGRAM_MAGIC.to_ne_bytes());
        let at = offset_of!(HistogramHeader, num_buckets);
        bytes[at..at + 8].copy_from_slice(&4u64.to_ne_bytes());
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(ProfilerError::Truncated { offset: 0 })
        ));
    }
}
