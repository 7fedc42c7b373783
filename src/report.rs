//! Report output for analysed traces
//!
//! One report model, rendered either as pretty JSON (`mpiperf-json-v1`) or as
//! plain text. Sections are optional and only emitted when requested.

use crate::aggregate::RankScope;
use crate::call_tree::CallTreeNodeRef;
use crate::causal_graph::GraphNode;
use crate::comm_matrix::{CommMatrix, MessageHistogram};
use crate::critical_path::SegmentCategory;
use crate::engine::{Analysis, TraceSummary};
use crate::event::{OperationId, RankId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A rank excluded from the analysis
#[derive(Debug, Clone, Serialize)]
pub struct JsonFailedRank {
    pub rank: RankId,
    pub event_index: usize,
    pub reason: String,
}

/// One node of the critical path
#[derive(Debug, Clone, Serialize)]
pub struct JsonPathSegment {
    /// "start", "end", "event" or "collective"
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<RankId>,
    pub timestamp: u64,
    pub weight: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<SegmentCategory>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonCriticalPath {
    pub total_duration: u64,
    /// Path length as a share of the wall time (0-100)
    pub percentage_of_wall_time: f64,
    pub by_category: BTreeMap<SegmentCategory, u64>,
    pub segments: Vec<JsonPathSegment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonAggregateRow {
    pub operation: String,
    /// "all" or a rank number
    pub scope: String,
    pub inclusive_time: u64,
    pub exclusive_time: u64,
    pub call_count: u64,
    pub bytes_transferred: u64,
    pub wait_time: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonImbalance {
    pub operation: String,
    pub ranks: usize,
    pub mean: f32,
    pub stddev: f32,
    pub min: f32,
    pub max: f32,
    pub imbalance: f32,
}

/// Call tree frame with its nested children
#[derive(Debug, Clone, Serialize)]
pub struct JsonFrame {
    pub operation: String,
    pub start: u64,
    pub end: u64,
    pub inclusive: u64,
    pub exclusive: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<JsonFrame>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonCallTree {
    pub rank: RankId,
    pub root: JsonFrame,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonMatrix {
    pub grouping: String,
    pub groups: Vec<Vec<RankId>>,
    pub messages: Vec<Vec<u64>>,
    pub bytes: Vec<Vec<u64>>,
}

/// Root report structure
#[derive(Debug, Clone, Serialize)]
pub struct JsonReport {
    /// Crate version that produced the report
    pub version: String,
    pub format: String,
    pub summary: TraceSummary,
    pub failed_ranks: Vec<JsonFailedRank>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical_path: Option<JsonCriticalPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregates: Option<Vec<JsonAggregateRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imbalance: Option<Vec<JsonImbalance>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub call_trees: Vec<JsonCallTree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix: Option<JsonMatrix>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub histograms: Vec<MessageHistogram>,
}

impl JsonReport {
    /// Report with summary, failed ranks and warnings only
    pub fn new(analysis: &Analysis) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "mpiperf-json-v1".to_string(),
            summary: analysis.summary(),
            failed_ranks: analysis
                .failed_ranks()
                .iter()
                .map(|f| JsonFailedRank {
                    rank: f.rank,
                    event_index: f.event_index,
                    reason: f.reason.to_string(),
                })
                .collect(),
            warnings: analysis.warnings().iter().map(|w| w.to_string()).collect(),
            critical_path: None,
            aggregates: None,
            imbalance: None,
            call_trees: Vec::new(),
            matrix: None,
            histograms: Vec::new(),
        }
    }

    pub fn set_critical_path(&mut self, analysis: &Analysis) {
        let path = analysis.critical_path_summary();
        let segments = path
            .segments
            .iter()
            .map(|s| JsonPathSegment {
                location: match s.location {
                    GraphNode::GlobalStart => "start",
                    GraphNode::GlobalEnd => "end",
                    GraphNode::Event(_) => "event",
                    GraphNode::CollectiveSync { .. } => "collective",
                }
                .to_string(),
                rank: s.rank,
                timestamp: s.timestamp,
                weight: s.weight,
                category: s.category,
            })
            .collect();

        self.critical_path = Some(JsonCriticalPath {
            total_duration: path.total_duration,
            percentage_of_wall_time: path.critical_path_percentage(self.summary.wall_time),
            by_category: path.time_by_category(),
            segments,
        });
    }

    /// Aggregate rows for each scope, plus the imbalance table
    pub fn set_aggregates(&mut self, analysis: &Analysis, scopes: &[RankScope]) {
        let name = |op: OperationId| analysis.operation_name(op).into_owned();
        let rows = scopes
            .iter()
            .flat_map(|&scope| analysis.aggregate(None, scope))
            .map(|row| JsonAggregateRow {
                operation: name(row.operation),
                scope: row.scope.to_string(),
                inclusive_time: row.stats.inclusive_time,
                exclusive_time: row.stats.exclusive_time,
                call_count: row.stats.call_count,
                bytes_transferred: row.stats.bytes_transferred,
                wait_time: row.stats.wait_time,
            })
            .collect();
        self.aggregates = Some(rows);

        self.imbalance = Some(
            analysis
                .aggregates()
                .imbalances()
                .into_iter()
                .map(|i| JsonImbalance {
                    operation: name(i.operation),
                    ranks: i.ranks,
                    mean: i.mean,
                    stddev: i.stddev,
                    min: i.min,
                    max: i.max,
                    imbalance: i.imbalance,
                })
                .collect(),
        );
    }

    pub fn add_call_tree(&mut self, analysis: &Analysis, rank: RankId) {
        if let Some(root) = analysis.call_tree(rank) {
            self.call_trees.push(JsonCallTree {
                rank,
                root: frame(analysis, root),
            });
        }
    }

    pub fn set_matrix(&mut self, grouping: &str, matrix: &CommMatrix) {
        self.matrix = Some(JsonMatrix {
            grouping: grouping.to_string(),
            groups: matrix.groups().to_vec(),
            messages: matrix.message_rows(),
            bytes: matrix.byte_rows(),
        });
    }

    pub fn add_histogram(&mut self, histogram: MessageHistogram) {
        self.histograms.push(histogram);
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Render as human-readable text
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let s = &self.summary;
        let _ = writeln!(out, "=== Trace Summary ===");
        let _ = writeln!(
            out,
            "ranks: {} ({} failed)  events: {}  messages: {}  collectives: {}",
            s.ranks, s.failed_ranks, s.events, s.messages, s.collectives
        );
        let _ = writeln!(
            out,
            "time: {}..{}  wall time: {}  critical path: {}",
            s.start, s.end, s.wall_time, s.critical_path_length
        );

        for failed in &self.failed_ranks {
            let _ = writeln!(
                out,
                "failed rank {} at event {}: {}",
                failed.rank, failed.event_index, failed.reason
            );
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "\n=== Warnings ({}) ===", self.warnings.len());
            for warning in &self.warnings {
                let _ = writeln!(out, "  {}", warning);
            }
        }

        if let Some(path) = &self.critical_path {
            let _ = writeln!(
                out,
                "\n=== Critical Path ({} units, {:.1}% of wall time) ===",
                path.total_duration, path.percentage_of_wall_time
            );
            for (category, time) in &path.by_category {
                let _ = writeln!(out, "  {:<20} {:>12}", format!("{:?}", category), time);
            }
            let _ = writeln!(out, "{:>6} {:>12} {:>10}  {}", "rank", "timestamp", "weight", "node");
            for segment in &path.segments {
                let rank = segment
                    .rank
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(
                    out,
                    "{:>6} {:>12} {:>10}  {}",
                    rank, segment.timestamp, segment.weight, segment.location
                );
            }
        }

        if let Some(rows) = &self.aggregates {
            let _ = writeln!(out, "\n=== Aggregates ===");
            let _ = writeln!(
                out,
                "{:<24} {:>6} {:>12} {:>12} {:>8} {:>12} {:>10}",
                "operation", "scope", "inclusive", "exclusive", "calls", "bytes", "wait"
            );
            let _ = writeln!(out, "{}", "-".repeat(90));
            for row in rows {
                let _ = writeln!(
                    out,
                    "{:<24} {:>6} {:>12} {:>12} {:>8} {:>12} {:>10}",
                    row.operation,
                    row.scope,
                    row.inclusive_time,
                    row.exclusive_time,
                    row.call_count,
                    row.bytes_transferred,
                    row.wait_time
                );
            }
        }
        if let Some(imbalance) = &self.imbalance {
            if !imbalance.is_empty() {
                let _ = writeln!(out, "\n=== Imbalance ===");
                for i in imbalance {
                    let _ = writeln!(
                        out,
                        "{:<24} ranks={} mean={:.2} stddev={:.2} min={:.2} max={:.2} imbalance={:.3}",
                        i.operation, i.ranks, i.mean, i.stddev, i.min, i.max, i.imbalance
                    );
                }
            }
        }

        for tree in &self.call_trees {
            let _ = writeln!(out, "\n=== Call Tree (rank {}) ===", tree.rank);
            write_frame(&mut out, &tree.root, 0);
        }

        if let Some(matrix) = &self.matrix {
            let _ = writeln!(out, "\n=== Message Matrix ({}) ===", matrix.grouping);
            let labels: Vec<String> = matrix
                .groups
                .iter()
                .map(|g| {
                    g.iter()
                        .map(|r| r.to_string())
                        .collect::<Vec<_>>()
                        .join("+")
                })
                .collect();
            let _ = write!(out, "{:>10}", "send\\recv");
            for label in &labels {
                let _ = write!(out, " {:>10}", label);
            }
            let _ = writeln!(out);
            for (label, row) in labels.iter().zip(&matrix.messages) {
                let _ = write!(out, "{:>10}", label);
                for count in row {
                    let _ = write!(out, " {:>10}", count);
                }
                let _ = writeln!(out);
            }
        }

        for histogram in &self.histograms {
            let _ = writeln!(
                out,
                "\n=== Message Histogram (rank {}, {:?}) ===",
                histogram.rank, histogram.axis
            );
            let _ = write!(out, "{:>8}", "peer");
            for value in &histogram.values {
                let _ = write!(out, " {:>8}", value);
            }
            let _ = writeln!(out);
            for (peer, row) in histogram.peers.iter().zip(&histogram.counts) {
                let _ = write!(out, "{:>8}", peer);
                for count in row {
                    let _ = write!(out, " {:>8}", count);
                }
                let _ = writeln!(out);
            }
        }

        out
    }
}

fn frame(analysis: &Analysis, node: CallTreeNodeRef<'_>) -> JsonFrame {
    JsonFrame {
        operation: node
            .operation()
            .map(|op| analysis.operation_name(op).into_owned())
            .unwrap_or_else(|| "<root>".to_string()),
        start: node.start(),
        end: node.end(),
        inclusive: node.inclusive(),
        exclusive: node.exclusive(),
        children: node.children().map(|child| frame(analysis, child)).collect(),
    }
}

fn write_frame(out: &mut String, frame: &JsonFrame, depth: usize) {
    let _ = writeln!(
        out,
        "{}{} [{}, {}] inclusive={} exclusive={}",
        "  ".repeat(depth),
        frame.operation,
        frame.start,
        frame.end,
        frame.inclusive,
        frame.exclusive
    );
    for child in &frame.children {
        write_frame(out, child, depth + 1);
    }
}
