//! TOML configuration.
//!
//! ```toml
//! path = "/dev/shm/histprof.shm"
//! format = "columnar"
//!
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [[histogram]]
//! label = "lat"
//! samples_per_bucket = 1000
//! buckets = 10
//!
//! [[rate]]
//! label = "requests"
//! nanos_per_bucket = 1000000000
//! buckets = 60
//! ```

use crate::context::{Declaration, RateDeclaration};
use crate::error::{ProfilerError, Result};
use crate::histogram::HistogramConfig;
use crate::rate;
use crate::report::OutputFormat;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Top-level profiler configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilerConfig {
    /// Backing file. Anonymous memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Report format name. Unrecognized names fall back to sequential.
    #[serde(default)]
    pub format: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default, rename = "histogram")]
    pub histograms: Vec<HistogramEntry>,

    #[serde(default, rename = "rate")]
    pub rates: Vec<RateEntry>,
}

/// One `[[histogram]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistogramEntry {
    pub label: String,
    pub samples_per_bucket: u64,
    pub buckets: usize,
    #[serde(default)]
    pub shift: u64,
}

/// One `[[rate]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateEntry {
    pub label: String,
    pub nanos_per_bucket: u64,
    pub buckets: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `histprof=debug`. `RUST_LOG`
    /// overrides it.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include the event target (module path).
    #[serde(default = "LoggingConfig::default_target")]
    pub target: bool,

    #[serde(default)]
    pub thread_names: bool,

    #[serde(default = "LoggingConfig::default_timestamps")]
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
            target: Self::default_target(),
            thread_names: false,
            timestamps: Self::default_timestamps(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_target() -> bool {
        true
    }

    fn default_timestamps() -> bool {
        true
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

impl ProfilerConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProfilerError::Config(format!("{}: {e}", path.display())))?;
        contents.parse()
    }

    /// Check declarations and the log filter.
    pub fn validate(&self) -> Result<()> {
        let mut labels = HashSet::new();
        for entry in &self.histograms {
            HistogramConfig::new(entry.samples_per_bucket, entry.buckets)
                .validate(&entry.label)?;
            if !labels.insert(entry.label.as_str()) {
                return Err(ProfilerError::DuplicateLabel(entry.label.clone()));
            }
        }

        let mut labels = HashSet::new();
        for entry in &self.rates {
            rate::validate(&entry.label, entry.nanos_per_bucket, entry.buckets)?;
            if !labels.insert(entry.label.as_str()) {
                return Err(ProfilerError::DuplicateLabel(entry.label.clone()));
            }
        }

        tracing_subscriber::EnvFilter::try_new(&self.logging.level).map_err(|e| {
            ProfilerError::Config(format!("invalid log level '{}': {e}", self.logging.level))
        })?;

        Ok(())
    }

    /// Histogram declarations in file order.
    pub fn declarations(&self) -> Vec<Declaration> {
        self.histograms
            .iter()
            .map(|entry| {
                Declaration::new(entry.label.as_str(), entry.samples_per_bucket, entry.buckets)
                    .with_shift(entry.shift)
            })
            .collect()
    }

    /// Rate counter declarations in file order.
    pub fn rate_declarations(&self) -> Vec<RateDeclaration> {
        self.rates
            .iter()
            .map(|entry| {
                RateDeclaration::new(entry.label.as_str(), entry.nanos_per_bucket, entry.buckets)
            })
            .collect()
    }

    /// The configured report format, sequential if unset or unrecognized.
    pub fn output_format(&self) -> OutputFormat {
        self.format
            .as_deref()
            .map(OutputFormat::parse_or_default)
            .unwrap_or_default()
    }
}

impl FromStr for ProfilerConfig {
    type Err = ProfilerError;

    /// Parse and validate TOML text.
    fn from_str(s: &str) -> Result<Self> {
        let config: ProfilerConfig =
            toml::from_str(s).map_err(|e| ProfilerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
