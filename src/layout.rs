//! Fixed-layout record headers shared with external readers.
//!
//! Every record in an arena is a page-sized header followed by a flat array
//! of `u64` buckets that starts on the next page boundary:
//!
//! ```text
//! 0                                  4096
//! +-------+--------+-----+-------------+---------------------------+
//! | magic | config | agg | description | buckets[num_buckets]      |
//! +-------+--------+-----+-------------+---------------------------+
//! ```
//!
//! Headers are `#[repr(C, align(4096))]`, so the arena's ordinary alignment
//! rules produce this layout without any special casing. All integer fields
//! are native-endian `u64`. A reader identifies the record kind by the first
//! eight bytes.

use std::sync::atomic::AtomicU64;

/// Size of a record header and the alignment of every record.
pub const PAGE_SIZE: usize = 4096;

/// Length of the NUL-padded description field.
pub const DESCRIPTION_LEN: usize = 128;

/// Magic number of a histogram record.
pub const HISTOGRAM_MAGIC: u64 = 0x0BAD_BABE_0000_0002;

/// Magic number of a rate counter record.
pub const RATE_COUNTER_MAGIC: u64 = 0x0BAD_BABE_0000_0003;

/// Header of a histogram record.
///
/// Configuration fields are written once, before the record is shared.
/// Aggregates are atomics so concurrent readers never race with the single
/// writer; the writer uses plain relaxed loads and stores.
#[repr(C, align(4096))]
#[derive(Debug)]
pub struct HistogramHeader {
    pub magic: u64,
    pub samples_per_bucket: u64,
    pub num_buckets: u64,
    pub shift: u64,
    pub num_samples: AtomicU64,
    pub sum: AtomicU64,
    pub min: AtomicU64,
    pub max: AtomicU64,
    pub overflows: AtomicU64,
    pub underflows: AtomicU64,
    pub description: [u8; DESCRIPTION_LEN],
}

impl HistogramHeader {
    /// Create an empty header. `min` starts at `u64::MAX` so the first sample
    /// always replaces it.
    pub fn new(samples_per_bucket: u64, num_buckets: u64, shift: u64, description: &str) -> Self {
        Self {
            magic: HISTOGRAM_MAGIC,
            samples_per_bucket,
            num_buckets,
            shift,
            num_samples: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
            underflows: AtomicU64::new(0),
            description: encode_description(description),
        }
    }
}

/// Header of a rate counter record.
#[repr(C, align(4096))]
#[derive(Debug)]
pub struct RateCounterHeader {
    pub magic: u64,
    pub nanos_per_bucket: u64,
    pub num_buckets: u64,
    pub current_index: AtomicU64,
    pub description: [u8; DESCRIPTION_LEN],
}

impl RateCounterHeader {
    pub fn new(nanos_per_bucket: u64, num_buckets: u64, description: &str) -> Self {
        Self {
            magic: RATE_COUNTER_MAGIC,
            nanos_per_bucket,
            num_buckets,
            current_index: AtomicU64::new(0),
            description: encode_description(description),
        }
    }
}

/// Encode `text` into a NUL-padded field, truncating on a UTF-8 boundary so
/// at least one terminating NUL remains.
pub fn encode_description(text: &str) -> [u8; DESCRIPTION_LEN] {
    let mut field = [0u8; DESCRIPTION_LEN];
    let mut len = text.len().min(DESCRIPTION_LEN - 1);
    while !text.is_char_boundary(len) {
        len -= 1;
    }
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
    field
}

/// Decode a NUL-padded description field.
pub fn decode_description(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_headers_fill_one_page() {
        assert_eq!(size_of::<HistogramHeader>(), PAGE_SIZE);
        assert_eq!(align_of::<HistogramHeader>(), PAGE_SIZE);
        assert_eq!(size_of::<RateCounterHeader>(), PAGE_SIZE);
        assert_eq!(align_of::<RateCounterHeader>(), PAGE_SIZE);
    }

    #[test]
    fn test_field_order() {
        assert_eq!(offset_of!(HistogramHeader, magic), 0);
        assert_eq!(offset_of!(HistogramHeader, samples_per_bucket), 8);
        assert_eq!(offset_of!(HistogramHeader, num_buckets), 16);
        assert_eq!(offset_of!(HistogramHeader, shift), 24);
        assert_eq!(offset_of!(HistogramHeader, num_samples), 32);
        assert_eq!(offset_of!(HistogramHeader, underflows), 72);
        assert_eq!(offset_of!(HistogramHeader, description), 80);

        assert_eq!(offset_of!(RateCounterHeader, magic), 0);
        assert_eq!(offset_of!(RateCounterHeader, nanos_per_bucket), 8);
        assert_eq!(offset_of!(RateCounterHeader, num_buckets), 16);
        assert_eq!(offset_of!(RateCounterHeader, current_index), 24);
        assert_eq!(offset_of!(RateCounterHeader, description), 32);
    }

    #[test]
    fn test_description_roundtrip() {
        let field = encode_description("lat [ThreadId(3)]");
        assert_eq!(decode_description(&field), "lat [ThreadId(3)]");
    }

    #[test]
    fn test_description_truncates_on_char_boundary() {
        // 'é' is two bytes; 64 of them straddle the 127 byte limit
        let long = "é".repeat(64);
        let field = encode_description(&long);
        let decoded = decode_description(&field);
        assert_eq!(decoded.len(), 126);
        assert_eq!(field[DESCRIPTION_LEN - 1], 0);
    }

    #[test]
    fn test_new_histogram_header() {
        let header = HistogramHeader::new(1000, 10, 2, "lat");
        assert_eq!(header.magic, HISTOGRAM_MAGIC);
        assert_eq!(header.num_buckets, 10);
        assert_eq!(header.min.into_inner(), u64::MAX);
    }
}
