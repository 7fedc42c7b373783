//! Communication matrices and per-rank message histograms
//!
//! A matrix counts matched point-to-point messages and their bytes per
//! (sender, receiver). Matrices over ranks can be regrouped into locality
//! groups (core, socket, NUMA domain, node) by summing over group members.

use crate::event::{LocalityLevel, RankId, TraceDefinitions};
use crate::filter::FilterSet;
use crate::matcher::MessageMatch;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Rows/columns of a matrix query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixGrouping {
    Rank,
    Locality(LocalityLevel),
}

/// Dense sender x receiver matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommMatrix {
    /// Ranks behind each row/column
    groups: Vec<Vec<RankId>>,
    /// Row-major message counts
    messages: Vec<u64>,
    /// Row-major byte totals
    bytes: Vec<u64>,
}

impl CommMatrix {
    /// One row/column per rank in `ranks`; messages touching other ranks are skipped
    pub fn from_messages<'a, I>(ranks: &[RankId], messages: I) -> Self
    where
        I: IntoIterator<Item = &'a MessageMatch>,
    {
        let index: BTreeMap<RankId, usize> =
            ranks.iter().enumerate().map(|(i, &rank)| (rank, i)).collect();
        let n = ranks.len();
        let mut matrix = Self {
            groups: ranks.iter().map(|&rank| vec![rank]).collect(),
            messages: vec![0; n * n],
            bytes: vec![0; n * n],
        };

        for message in messages {
            let sender = index.get(&message.sender());
            let receiver = index.get(&message.receiver());
            let (Some(&s), Some(&r)) = (sender, receiver) else {
                continue;
            };
            matrix.messages[s * n + r] += 1;
            matrix.bytes[s * n + r] += message.bytes;
        }
        matrix
    }

    /// Sum rows and columns into the given groups
    ///
    /// Ranks of this matrix that no group mentions keep a singleton group, so
    /// totals are preserved.
    pub fn regroup(&self, groups: &[Vec<RankId>]) -> Self {
        let mut target: BTreeMap<RankId, usize> = BTreeMap::new();
        let mut merged: Vec<Vec<RankId>> = Vec::new();
        for group in groups {
            let members: Vec<RankId> = group
                .iter()
                .copied()
                .filter(|rank| self.position(*rank).is_some())
                .collect();
            if members.is_empty() {
                continue;
            }
            for &rank in &members {
                target.insert(rank, merged.len());
            }
            merged.push(members);
        }
        for rank in self.groups.iter().flatten() {
            if !target.contains_key(rank) {
                target.insert(*rank, merged.len());
                merged.push(vec![*rank]);
            }
        }

        // Map each current row to its new group via its first rank
        let mapping: Vec<usize> = self
            .groups
            .iter()
            .map(|group| {
                group
                    .first()
                    .and_then(|rank| target.get(rank))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();

        let n = self.size();
        let m = merged.len();
        let mut regrouped = Self {
            groups: merged,
            messages: vec![0; m * m],
            bytes: vec![0; m * m],
        };
        for s in 0..n {
            for r in 0..n {
                let cell = mapping[s] * m + mapping[r];
                regrouped.messages[cell] += self.messages[s * n + r];
                regrouped.bytes[cell] += self.bytes[s * n + r];
            }
        }
        regrouped
    }

    /// Regroup by a locality level of the trace; `None` if the level is undefined
    pub fn by_locality(
        &self,
        definitions: &TraceDefinitions,
        level: LocalityLevel,
    ) -> Option<Self> {
        definitions
            .locality_groups(level)
            .map(|groups| self.regroup(&groups))
    }

    fn position(&self, rank: RankId) -> Option<usize> {
        self.groups.iter().position(|group| group.contains(&rank))
    }

    /// Number of rows (and columns)
    pub fn size(&self) -> usize {
        self.groups.len()
    }

    pub fn groups(&self) -> &[Vec<RankId>] {
        &self.groups
    }

    pub fn messages(&self, sender: usize, receiver: usize) -> u64 {
        let n = self.size();
        if sender >= n || receiver >= n {
            return 0;
        }
        self.messages[sender * n + receiver]
    }

    pub fn bytes(&self, sender: usize, receiver: usize) -> u64 {
        let n = self.size();
        if sender >= n || receiver >= n {
            return 0;
        }
        self.bytes[sender * n + receiver]
    }

    pub fn total_messages(&self) -> u64 {
        self.messages.iter().sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.iter().sum()
    }

    /// Message counts as nested rows
    pub fn message_rows(&self) -> Vec<Vec<u64>> {
        self.messages
            .chunks(self.size().max(1))
            .map(<[u64]>::to_vec)
            .collect()
    }

    /// Byte totals as nested rows
    pub fn byte_rows(&self) -> Vec<Vec<u64>> {
        self.bytes
            .chunks(self.size().max(1))
            .map(<[u64]>::to_vec)
            .collect()
    }
}

/// Value axis of a message histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramAxis {
    Size,
    Tag,
}

/// Messages sent by one rank, counted per (peer, value)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageHistogram {
    pub rank: RankId,
    pub axis: HistogramAxis,
    /// Receivers, ascending
    pub peers: Vec<RankId>,
    /// Distinct sizes or tags, ascending
    pub values: Vec<i64>,
    /// `counts[p][v]`: messages to `peers[p]` with value `values[v]`
    pub counts: Vec<Vec<u64>>,
}

impl MessageHistogram {
    /// Build the histogram of `rank`'s sent messages
    ///
    /// Messages failing the size or tag filter are dropped, then cells whose
    /// count fails the count filter. Peers and values left without any
    /// message are removed.
    pub fn build<'a, I>(rank: RankId, axis: HistogramAxis, messages: I, filters: &FilterSet) -> Self
    where
        I: IntoIterator<Item = &'a MessageMatch>,
    {
        let mut cells: BTreeMap<(RankId, i64), u64> = BTreeMap::new();
        for message in messages {
            if message.sender() != rank || !filters.accepts_message(message.bytes, message.tag) {
                continue;
            }
            let value = match axis {
                HistogramAxis::Size => i64::try_from(message.bytes).unwrap_or(i64::MAX),
                HistogramAxis::Tag => i64::from(message.tag),
            };
            *cells.entry((message.receiver(), value)).or_insert(0) += 1;
        }
        cells.retain(|_, count| filters.accepts_count(*count));

        let peers: Vec<RankId> = cells
            .keys()
            .map(|(peer, _)| *peer)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let values: Vec<i64> = cells
            .keys()
            .map(|(_, value)| *value)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut counts = vec![vec![0u64; values.len()]; peers.len()];
        for ((peer, value), count) in cells {
            if let (Ok(p), Ok(v)) = (peers.binary_search(&peer), values.binary_search(&value)) {
                counts[p][v] = count;
            }
        }

        Self {
            rank,
            axis,
            peers,
            values,
            counts,
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
