//! Text reports of histogram contents.
//!
//! Two layouts are supported:
//!
//! - [`OutputFormat::Sequential`]: one block per histogram, a summary line
//!   followed by one bucket count per line and a blank separator line.
//! - [`OutputFormat::Columnar`]: one tab-separated summary row, then one
//!   tab-separated row per bucket index. Histograms with fewer buckets leave
//!   an empty cell once they run out. Pastes straight into a spreadsheet.

use crate::error::ProfilerError;
use crate::histogram::Histogram;
use serde::Deserialize;
use std::io::{self, Write};
use std::str::FromStr;

/// Report layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Histogram after histogram.
    #[default]
    #[serde(alias = "follow")]
    Sequential,
    /// Histograms side by side, tab separated.
    #[serde(alias = "excel")]
    Columnar,
}

impl OutputFormat {
    /// Parse a format name, falling back to [`OutputFormat::Sequential`]
    /// with a warning if it is not recognized.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|e: ProfilerError| {
            tracing::warn!(error = %e, "falling back to sequential report format");
            OutputFormat::Sequential
        })
    }
}

impl FromStr for OutputFormat {
    type Err = ProfilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" | "follow" => Ok(OutputFormat::Sequential),
            "columnar" | "excel" | "tsv" => Ok(OutputFormat::Columnar),
            _ => Err(ProfilerError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Sequential => write!(f, "sequential"),
            OutputFormat::Columnar => write!(f, "columnar"),
        }
    }
}

/// Write `histograms` (display name, histogram) to `out` in `format`.
pub fn write_report<W: Write>(
    out: &mut W,
    format: OutputFormat,
    histograms: &[(String, &Histogram)],
) -> io::Result<()> {
    match format {
        OutputFormat::Sequential => write_sequential(out, histograms),
        OutputFormat::Columnar => write_columnar(out, histograms),
    }
}

fn write_sequential<W: Write>(out: &mut W, histograms: &[(String, &Histogram)]) -> io::Result<()> {
    for (name, histogram) in histograms {
        writeln!(out, "{}", histogram.summary(name))?;
        for count in histogram.buckets() {
            writeln!(out, "{count}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_columnar<W: Write>(out: &mut W, histograms: &[(String, &Histogram)]) -> io::Result<()> {
    if histograms.is_empty() {
        return Ok(());
    }

    let header: Vec<String> = histograms
        .iter()
        .map(|(name, histogram)| histogram.summary(name))
        .collect();
    writeln!(out, "{}", header.join("\t"))?;

    // snapshot once so every row comes from the same read of each column
    let columns: Vec<Vec<u64>> = histograms.iter().map(|(_, h)| h.buckets()).collect();
    let rows = columns.iter().map(Vec::len).max().unwrap_or(0);

    for row in 0..rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| column.get(row).map(u64::to_string).unwrap_or_default())
            .collect();
        writeln!(out, "{}", cells.join("\t"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::histogram::HistogramConfig;
    use crate::layout::HistogramHeader;
    use std::sync::atomic::AtomicU64;

    fn pair(a_buckets: usize, b_buckets: usize) -> (Histogram, Histogram) {
        let arena = Arena::create(
            None,
            Arena::reservation::<HistogramHeader, AtomicU64>(a_buckets).unwrap()
                + Arena::reservation::<HistogramHeader, AtomicU64>(b_buckets).unwrap(),
        )
        .unwrap();
        let a = Histogram::allocate(&arena, HistogramConfig::new(1, a_buckets), "a").unwrap();
        let b = Histogram::allocate(&arena, HistogramConfig::new(1, b_buckets), "b").unwrap();
        (a, b)
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("sequential".parse::<OutputFormat>().unwrap(), OutputFormat::Sequential);
        assert_eq!("follow".parse::<OutputFormat>().unwrap(), OutputFormat::Sequential);
        assert_eq!("Columnar".parse::<OutputFormat>().unwrap(), OutputFormat::Columnar);
        assert_eq!("excel".parse::<OutputFormat>().unwrap(), OutputFormat::Columnar);
        assert!(matches!(
            "xml".parse::<OutputFormat>(),
            Err(ProfilerError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_parse_or_default_falls_back() {
        assert_eq!(OutputFormat::parse_or_default("xml"), OutputFormat::Sequential);
        assert_eq!(OutputFormat::parse_or_default("columnar"), OutputFormat::Columnar);
    }

    #[test]
    fn test_sequential_layout() {
        let (a, b) = pair(3, 2);
        a.input(1);
        b.input(0);
        b.input(0);

        let mut out = Vec::new();
        write_report(
            &mut out,
            OutputFormat::Sequential,
            &[("a".to_string(), &a), ("b".to_string(), &b)],
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 1 + 3 + 1 + 1 + 2 + 1);
        assert!(lines[0].starts_with("a, #buckets: 3, #samples: 1"));
        assert_eq!(&lines[1..4], &["0", "1", "0"]);
        assert_eq!(lines[4], "");
        assert!(lines[5].starts_with("b, #buckets: 2, #samples: 2"));
        assert_eq!(&lines[6..8], &["2", "0"]);
    }

    #[test]
    fn test_columnar_layout() {
        let (a, b) = pair(4, 2);
        a.input(3);
        b.input(1);

        let mut out = Vec::new();
        write_report(
            &mut out,
            OutputFormat::Columnar,
            &[("a".to_string(), &a), ("b".to_string(), &b)],
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 1 + 4);
        let header: Vec<&str> = lines[0].split('\t').collect();
        assert_eq!(header.len(), 2);
        assert!(header[0].starts_with("a, "));
        assert!(header[1].starts_with("b, "));

        assert_eq!(lines[1], "0\t0");
        assert_eq!(lines[2], "0\t1");
        assert_eq!(lines[3], "0\t");
        assert_eq!(lines[4], "1\t");
    }

    #[test]
    fn test_empty_report() {
        let mut out = Vec::new();
        write_report(&mut out, OutputFormat::Columnar, &[]).unwrap();
        write_report(&mut out, OutputFormat::Sequential, &[]).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(OutputFormat::Sequential.to_string(), "sequential");
        assert_eq!(OutputFormat::Columnar.to_string(), "columnar");
    }
}
