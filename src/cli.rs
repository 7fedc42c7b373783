//! CLI argument parsing for mpiperf

use crate::comm_matrix::{HistogramAxis, MatrixGrouping};
use crate::event::LocalityLevel;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

/// Rows and columns of the message matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MatrixArg {
    Rank,
    Core,
    Socket,
    Numa,
    Node,
}

impl MatrixArg {
    pub fn grouping(self) -> MatrixGrouping {
        match self {
            MatrixArg::Rank => MatrixGrouping::Rank,
            MatrixArg::Core => MatrixGrouping::Locality(LocalityLevel::Core),
            MatrixArg::Socket => MatrixGrouping::Locality(LocalityLevel::Socket),
            MatrixArg::Numa => MatrixGrouping::Locality(LocalityLevel::Numa),
            MatrixArg::Node => MatrixGrouping::Locality(LocalityLevel::Node),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MatrixArg::Rank => "rank",
            MatrixArg::Core => "core",
            MatrixArg::Socket => "socket",
            MatrixArg::Numa => "numa",
            MatrixArg::Node => "node",
        }
    }
}

/// Value axis of message histograms
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HistogramArg {
    Size,
    Tag,
}

impl From<HistogramArg> for HistogramAxis {
    fn from(arg: HistogramArg) -> Self {
        match arg {
            HistogramArg::Size => HistogramAxis::Size,
            HistogramArg::Tag => HistogramAxis::Tag,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "mpiperf")]
#[command(version)]
#[command(about = "MPI trace reconstruction and critical-path analysis", long_about = None)]
pub struct Cli {
    /// JSON-lines trace file
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Show the critical path
    #[arg(long = "critical-path")]
    pub critical_path: bool,

    /// Show aggregate timing per operation (per rank with --rank)
    #[arg(long = "aggregate")]
    pub aggregate: bool,

    /// Rank or rank list (e.g. 3 or 0-3,7) for per-rank sections
    #[arg(long = "rank", value_name = "RANKS")]
    pub rank: Option<String>,

    /// Show call trees (all ranks unless --rank is given)
    #[arg(long = "call-tree")]
    pub call_tree: bool,

    /// Show the message matrix grouped by rank or locality
    #[arg(long = "matrix", value_enum, value_name = "GROUPING")]
    pub matrix: Option<MatrixArg>,

    /// Show message histograms of the --rank ranks
    #[arg(long = "histogram", value_enum, value_name = "AXIS", requires = "rank")]
    pub histogram: Option<HistogramArg>,

    /// Histogram filter (e.g. size:[0;1024]=tag:!5=count:[2;+inf])
    #[arg(long = "filter", value_name = "EXPR")]
    pub filter: Option<String>,

    /// Enable debug logging to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_trace() {
        let cli = Cli::parse_from(["mpiperf", "trace.jsonl"]);
        assert_eq!(cli.trace, PathBuf::from("trace.jsonl"));
        assert_eq!(cli.format, OutputFormat::Text);
        assert!(!cli.critical_path);
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_requires_trace() {
        assert!(Cli::try_parse_from(["mpiperf"]).is_err());
    }

    #[test]
    fn test_cli_sections() {
        let cli = Cli::parse_from([
            "mpiperf",
            "t.jsonl",
            "--critical-path",
            "--aggregate",
            "--call-tree",
            "--format",
            "json",
        ]);
        assert!(cli.critical_path);
        assert!(cli.aggregate);
        assert!(cli.call_tree);
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn test_cli_matrix_grouping() {
        let cli = Cli::parse_from(["mpiperf", "t.jsonl", "--matrix", "numa"]);
        assert_eq!(
            cli.matrix.map(MatrixArg::grouping),
            Some(MatrixGrouping::Locality(LocalityLevel::Numa))
        );
    }

    #[test]
    fn test_cli_histogram_requires_rank() {
        assert!(Cli::try_parse_from(["mpiperf", "t.jsonl", "--histogram", "size"]).is_err());

        let cli = Cli::parse_from([
            "mpiperf",
            "t.jsonl",
            "--histogram",
            "tag",
            "--rank",
            "0-3",
            "--filter",
            "tag:!5",
        ]);
        assert_eq!(cli.histogram, Some(HistogramArg::Tag));
        assert_eq!(cli.rank.as_deref(), Some("0-3"));
        assert_eq!(cli.filter.as_deref(), Some("tag:!5"));
    }
}
