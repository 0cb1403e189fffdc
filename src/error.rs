//! Error types for profiler setup and snapshot decoding.
//!
//! Only construction-time operations return these. The sampling path
//! (`begin`, `end`, `input`, `count`) never fails.

/// Errors that can occur while building or reading profiler state.
#[derive(Debug, thiserror::Error)]
pub enum ProfilerError {
    /// The backing store could not be opened, sized, mapped or read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An arena reservation would run past the end of the mapping.
    /// This means the arena was sized incorrectly.
    #[error("arena out of space: requested {requested} bytes, {available} available")]
    OutOfSpace {
        /// Bytes needed for the reservation, including alignment padding.
        requested: usize,
        /// Bytes left between the cursor and the end of the arena.
        available: usize,
    },

    /// A declaration has a configuration that cannot be sampled into.
    #[error("invalid declaration for '{label}': {reason}")]
    InvalidDeclaration {
        /// Display form of the offending label.
        label: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Two declarations in the same batch share a label.
    #[error("duplicate label '{0}'")]
    DuplicateLabel(String),

    /// A report format name that is not recognized.
    #[error("unsupported output format '{0}'")]
    UnsupportedFormat(String),

    /// A record header starts with a magic number we do not know.
    #[error("unrecognized record magic {0:#018x}")]
    UnknownMagic(u64),

    /// A record extends past the end of the snapshot.
    #[error("truncated record at offset {offset}")]
    Truncated {
        /// Byte offset of the record header.
        offset: usize,
    },

    /// The configuration file could not be read, parsed or validated.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type for profiler operations.
pub type Result<T> = std::result::Result<T, ProfilerError>;
