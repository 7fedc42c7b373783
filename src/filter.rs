//! Value filters for message histograms, and rank-list parsing
//!
//! Supported expressions:
//! - Exact values: `5`
//! - Ranges, bounds inclusive: `[0;1024]`, `[-inf;10]`, `[4096;+inf]`
//! - Lists (any element matches): `1,2,[10;20]`
//! - Inversion: `!` prefix on a whole list, e.g. `![0;64]`
//!
//! A [`FilterSet`] combines filters for message size, cell count and tag:
//! `size:[0;1024]=tag:!0,1=count:[2;+inf]`. The count filter takes a single
//! range only.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::event::RankId;

fn range_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\[([+-]?(?:inf|\d+));([+-]?(?:inf|\d+))\]$")
            .expect("built-in range pattern must compile")
    })
}

/// Inclusive integer range; `None` bounds are infinite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeFilter {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl RangeFilter {
    pub fn new(min: Option<i64>, max: Option<i64>) -> Self {
        Self { min, max }
    }

    pub fn accepts(&self, value: i64) -> bool {
        self.min.map_or(true, |min| min <= value) && self.max.map_or(true, |max| value <= max)
    }

    /// Parse `[min;max]`; returns `Ok(None)` if `s` is not range-shaped
    fn parse(s: &str) -> Result<Option<Self>> {
        let Some(captures) = range_pattern().captures(s) else {
            return Ok(None);
        };
        let (min, max) = (&captures[1], &captures[2]);

        let min = match min {
            "-inf" => None,
            _ => Some(min.parse::<i64>().with_context(|| {
                format!(
                    "Minimum \"{}\" of range \"{}\" is not an integer or negative infinity",
                    min, s
                )
            })?),
        };
        let max = match max {
            "inf" | "+inf" => None,
            _ => Some(max.parse::<i64>().with_context(|| {
                format!(
                    "Maximum \"{}\" of range \"{}\" is not an integer or positive infinity",
                    max, s
                )
            })?),
        };
        Ok(Some(Self { min, max }))
    }
}

impl fmt::Display for RangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.min {
            Some(min) => write!(f, "[{};", min)?,
            None => write!(f, "[-inf;")?,
        }
        match self.max {
            Some(max) => write!(f, "{}]", max),
            None => write!(f, "+inf]"),
        }
    }
}

/// One element of a filter list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSegment {
    Exact(i64),
    Range(RangeFilter),
}

impl FilterSegment {
    pub fn accepts(&self, value: i64) -> bool {
        match self {
            FilterSegment::Exact(n) => *n == value,
            FilterSegment::Range(range) => range.accepts(value),
        }
    }
}

impl fmt::Display for FilterSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterSegment::Exact(n) => write!(f, "{}", n),
            FilterSegment::Range(range) => write!(f, "{}", range),
        }
    }
}

/// Filter over integer values (sizes, tags, counts)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValueFilter {
    /// Everything passes
    #[default]
    Unfiltered,
    /// Any of the segments matches
    MultiRange(Vec<FilterSegment>),
    /// The inner filter does not match
    Inverted(Box<ValueFilter>),
}

impl ValueFilter {
    /// Parse a filter expression; the empty string is [`ValueFilter::Unfiltered`]
    pub fn from_expr(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(ValueFilter::Unfiltered);
        }
        if let Some(inner) = expr.strip_prefix('!') {
            if inner.trim().is_empty() {
                bail!("Inverted filter \"{}\" has nothing to invert", expr);
            }
            return Ok(ValueFilter::Inverted(Box::new(Self::from_expr(inner)?)));
        }

        let mut segments = Vec::new();
        for part in expr.split(',') {
            let part = part.trim();
            if part.is_empty() {
                bail!("Empty element in filter \"{}\"", expr);
            }
            let segment = match RangeFilter::parse(part)? {
                Some(range) => FilterSegment::Range(range),
                None => FilterSegment::Exact(
                    part.parse::<i64>()
                        .with_context(|| format!("\"{}\" is not a finite integer", part))?,
                ),
            };
            segments.push(segment);
        }
        Ok(ValueFilter::MultiRange(segments))
    }

    pub fn accepts(&self, value: i64) -> bool {
        match self {
            ValueFilter::Unfiltered => true,
            ValueFilter::MultiRange(segments) => segments.iter().any(|s| s.accepts(value)),
            ValueFilter::Inverted(inner) => !inner.accepts(value),
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        matches!(self, ValueFilter::Unfiltered)
    }
}

impl FromStr for ValueFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_expr(s)
    }
}

impl fmt::Display for ValueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueFilter::Unfiltered => Ok(()),
            ValueFilter::MultiRange(segments) => {
                for (i, segment) in segments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", segment)?;
                }
                Ok(())
            }
            ValueFilter::Inverted(inner) => write!(f, "!{}", inner),
        }
    }
}

/// Filters applied to a message histogram
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterSet {
    /// Message payload size in bytes
    pub size: ValueFilter,
    /// Number of messages in a histogram cell
    pub count: Option<RangeFilter>,
    /// Message tag
    pub tag: ValueFilter,
}

impl FilterSet {
    /// Parse `size:EXPR=count:[a;b]=tag:EXPR`, any subset and order
    pub fn from_expr(expr: &str) -> Result<Self> {
        let mut filters = FilterSet::default();
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(filters);
        }

        for part in expr.split('=') {
            let Some((name, value)) = part.split_once(':') else {
                bail!(
                    "Invalid filter \"{}\". Expected format: size:EXPR, tag:EXPR or count:[MIN;MAX]",
                    part
                );
            };
            match name.trim() {
                "size" => filters.size = ValueFilter::from_expr(value)?,
                "tag" => filters.tag = ValueFilter::from_expr(value)?,
                "count" => {
                    let value = value.trim();
                    match RangeFilter::parse(value)? {
                        Some(range) => filters.count = Some(range),
                        None => bail!("Count filter \"{}\" must be a single [MIN;MAX] range", value),
                    }
                }
                other => bail!("Unknown filter \"{}\". Expected size, tag or count", other),
            }
        }
        Ok(filters)
    }

    pub fn accepts_message(&self, size: u64, tag: i32) -> bool {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        self.size.accepts(size) && self.tag.accepts(i64::from(tag))
    }

    pub fn accepts_count(&self, count: u64) -> bool {
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        self.count.map_or(true, |range| range.accepts(count))
    }
}

impl FromStr for FilterSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_expr(s)
    }
}

impl fmt::Display for FilterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut active = Vec::new();
        if !self.size.is_unfiltered() {
            active.push(format!("size:{}", self.size));
        }
        if let Some(count) = self.count {
            active.push(format!("count:{}", count));
        }
        if !self.tag.is_unfiltered() {
            active.push(format!("tag:{}", self.tag));
        }
        write!(f, "{}", active.join("="))
    }
}

/// Parse a rank list such as `0-3,7`
///
/// Ranges are inclusive; a descending range is an error.
pub fn parse_rank_list(list: &str) -> Result<BTreeSet<RankId>> {
    let mut ranks = BTreeSet::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            bail!("Empty element in rank list \"{}\"", list);
        }
        match part.split_once('-') {
            Some((first, last)) => {
                let first: u32 = first
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid rank \"{}\" in \"{}\"", first, part))?;
                let last: u32 = last
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid rank \"{}\" in \"{}\"", last, part))?;
                if first > last {
                    bail!("Invalid range \"{}\": start is after end", part);
                }
                ranks.extend((first..=last).map(RankId));
            }
            None => {
                let rank: u32 = part
                    .parse()
                    .with_context(|| format!("Invalid rank \"{}\"", part))?;
                ranks.insert(RankId(rank));
            }
        }
    }
    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_range() {
        let filter = ValueFilter::from_expr("5,[10;20]").unwrap();
        assert!(filter.accepts(5));
        assert!(filter.accepts(10));
        assert!(filter.accepts(20));
        assert!(!filter.accepts(6));
        assert!(!filter.accepts(21));
    }

    #[test]
    fn test_infinite_bounds() {
        let filter = ValueFilter::from_expr("[-inf;0]").unwrap();
        assert!(filter.accepts(i64::MIN));
        assert!(!filter.accepts(1));

        let filter = ValueFilter::from_expr("[100;+inf]").unwrap();
        assert!(filter.accepts(i64::MAX));
        assert!(!filter.accepts(99));

        let filter = ValueFilter::from_expr("[100;inf]").unwrap();
        assert!(filter.accepts(1_000_000));
    }

    #[test]
    fn test_bad_infinities_rejected() {
        assert!(ValueFilter::from_expr("[+inf;5]").is_err());
        assert!(ValueFilter::from_expr("[0;-inf]").is_err());
    }

    #[test]
    fn test_inverted() {
        let filter = ValueFilter::from_expr("![0;64]").unwrap();
        assert!(!filter.accepts(32));
        assert!(filter.accepts(65));
        assert_eq!(filter.to_string(), "![0;64]");
        assert!(ValueFilter::from_expr("!").is_err());
    }

    #[test]
    fn test_negative_exact_tags() {
        let filter = ValueFilter::from_expr("-16,-12").unwrap();
        assert!(filter.accepts(-16));
        assert!(!filter.accepts(16));
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(ValueFilter::from_expr("abc").is_err());
        assert!(ValueFilter::from_expr("1,,2").is_err());
        assert!(ValueFilter::from_expr("[1;2").is_err());
        assert!(ValueFilter::from_expr("").unwrap().is_unfiltered());
    }

    #[test]
    fn test_display_round_trip() {
        let filter = ValueFilter::from_expr("[-inf;3],7").unwrap();
        assert_eq!(filter.to_string(), "[-inf;3],7");
        assert_eq!(ValueFilter::from_expr(&filter.to_string()).unwrap(), filter);
    }

    #[test]
    fn test_filter_set_parse() {
        let set = FilterSet::from_expr("size:[0;1024]=tag:!0=count:[2;+inf]").unwrap();
        assert!(set.accepts_message(512, 3));
        assert!(!set.accepts_message(512, 0));
        assert!(!set.accepts_message(4096, 3));
        assert!(set.accepts_count(2));
        assert!(!set.accepts_count(1));
        assert_eq!(set.to_string(), "size:[0;1024]=count:[2;+inf]=tag:!0");
    }

    #[test]
    fn test_filter_set_errors() {
        assert!(FilterSet::from_expr("count:5").is_err());
        assert!(FilterSet::from_expr("color:5").is_err());
        assert!(FilterSet::from_expr("size").is_err());
        assert_eq!(FilterSet::from_expr("").unwrap(), FilterSet::default());
    }

    #[test]
    fn test_rank_list() {
        let ranks = parse_rank_list("0-3,7").unwrap();
        let expected: BTreeSet<RankId> = [0, 1, 2, 3, 7].into_iter().map(RankId).collect();
        assert_eq!(ranks, expected);

        assert!(parse_rank_list("3-1").is_err());
        assert!(parse_rank_list("a").is_err());
        assert!(parse_rank_list("1,,2").is_err());
        assert_eq!(parse_rank_list("4-4").unwrap().len(), 1);
    }
}
