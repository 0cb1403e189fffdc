//! Low overhead sampling histograms backed by shared memory.
//!
//! Callers bracket regions of code with [`Context::begin`] and
//! [`Context::end`] (or push samples directly), and the elapsed nanoseconds
//! are accumulated into fixed-size linear histograms. Every histogram lives in
//! a memory mapping that can be backed by a file, so another process can read
//! live values, or a post-mortem copy, with [`Snapshot`] without stopping the
//! producer.
//!
//! Each histogram has a single writer. The global entry for a label is
//! written by whoever calls `begin`/`end`; the `*_for_current_thread`
//! variants give every thread its own entry, copied from the global one on
//! first use.

#![warn(clippy::all)]

pub mod arena;
pub mod config;
pub mod context;
pub mod error;
pub mod histogram;
pub mod layout;
pub mod logging;
pub mod rate;
pub mod report;
pub mod snapshot;

pub use arena::{Allocation, Arena};
pub use config::{LogFormat, LoggingConfig, ProfilerConfig};
pub use context::{Context, Declaration, Entry, RateDeclaration, Span};
pub use error::{ProfilerError, Result};
pub use histogram::{Histogram, HistogramConfig};
pub use rate::RateCounter;
pub use report::OutputFormat;
pub use snapshot::{HistogramRecord, RateCounterRecord, Record, Snapshot};
