//! Core data types shared across the query core
//!
//! # Key Types
//!
//! - **`Labels`**: ordered label set identifying one series
//! - **`Query`**: per-call request context (window, step, pagination, cache keys)
//! - **`Point`** / **`Series`** / **`Matrix`** / **`PageMatrix`**: evaluation output
//!
//! # Example
//!
//! ```rust
//! use kuba_shardquery::types::{Labels, Query};
//!
//! let labels = Labels::from_pairs([("job", "api"), ("host", "a")]);
//! assert_eq!(labels.to_labels_str(), r#"host="a",job="api""#);
//! assert_eq!(labels.fingerprint().len(), 16);
//!
//! let query = Query::range(0, 3_600_000, 60_000);
//! assert!(!query.is_instant);
//! ```

use std::fmt;

use crc::{Crc, CRC_64_ECMA_182};
use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{anychar, char, none_of},
    combinator::all_consuming,
    multi::{fold_many0, separated_list0},
    sequence::{delimited, preceded, separated_pair},
    IResult, Parser,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One minute in milliseconds
pub const MINUTE_MS: i64 = 60_000;

/// Width of the short shard-routing boundary
pub const ROUTING_30M_MS: i64 = 30 * MINUTE_MS;

/// Width of the long shard-routing boundary
pub const ROUTING_2H_MS: i64 = 120 * MINUTE_MS;

/// Granularity instant ranges above two hours must be a multiple of
pub const INSTANT_RANGE_GRANULARITY_MS: i64 = 5 * MINUTE_MS;

/// Field holding the series fingerprint in fingerprint-indexed indices
pub const TSID_FIELD: &str = "__tsid";

/// Field holding the canonical label string in legacy indices
pub const LABELS_STR_FIELD: &str = "__labels_str";

/// Label carrying the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

const FINGERPRINT: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Stable fingerprint of a series ("tsid")
pub type Tsid = String;

/// Fingerprint of a canonical label string
pub fn fingerprint(labels_str: &str) -> Tsid {
    format!("{:016x}", FINGERPRINT.checksum(labels_str.as_bytes()))
}

// ============================================================================
// Labels
// ============================================================================

/// A single label pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label name
    pub name: String,
    /// Label value
    pub value: String,
}

/// Label set ordered by name, names unique
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Empty label set
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from name/value pairs; later duplicates replace earlier ones
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut labels = Self::new();
        for (name, value) in pairs {
            labels.insert(name, value);
        }
        labels
    }

    /// Insert or replace a label, keeping name order
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.binary_search_by(|l| l.name.as_str().cmp(name.as_str())) {
            Ok(pos) => self.0[pos].value = value,
            Err(pos) => self.0.insert(pos, Label { name, value }),
        }
    }

    /// Remove a label if present
    pub fn remove(&mut self, name: &str) {
        if let Ok(pos) = self.0.binary_search_by(|l| l.name.as_str().cmp(name)) {
            self.0.remove(pos);
        }
    }

    /// Value of a label
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|pos| self.0[pos].value.as_str())
    }

    /// Iterate labels in name order
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical `name="value",...` rendering stored in `__labels_str`
    pub fn to_labels_str(&self) -> String {
        let mut out = String::new();
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&label.name);
            out.push_str("=\"");
            for c in label.value.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
        out
    }

    /// Parse the canonical rendering back into a label set
    pub fn parse_labels_str(s: &str) -> Result<Self> {
        let (_, pairs) = all_consuming(labels_str)
            .parse(s)
            .map_err(|e| Error::internal(format!("malformed label string {:?}: {}", s, e)))?;
        Ok(Self::from_pairs(pairs))
    }

    /// Fingerprint of the canonical rendering
    pub fn fingerprint(&self) -> Tsid {
        fingerprint(&self.to_labels_str())
    }
}

/// `name="value",name="value"` with backslash-escaped values
fn labels_str(input: &str) -> IResult<&str, Vec<(String, String)>> {
    separated_list0(char(','), label_pair).parse(input)
}

fn label_pair(input: &str) -> IResult<&str, (String, String)> {
    separated_pair(take_while1(|c: char| c != '='), char('='), label_value)
        .map(|(name, value): (&str, String)| (name.to_string(), value))
        .parse(input)
}

fn label_value(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((preceded(char('\\'), anychar), none_of("\\\""))),
            String::new,
            |mut acc, c| {
                acc.push(c);
                acc
            },
        ),
        char('"'),
    )
    .parse(input)
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.to_labels_str())
    }
}

// ============================================================================
// Query
// ============================================================================

/// Per-call request context
///
/// `sub_interval_*` and `fixed_*` are derived by the window normalizer on a
/// shallow copy; every other field is set by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Window start (ms)
    pub start: i64,
    /// Window end (ms)
    pub end: i64,
    /// Evaluation step (ms); equals the range for instant queries once normalized
    pub step: i64,
    /// Instant (single point) evaluation
    pub is_instant: bool,
    /// Bucket width for indices routed at 30 minutes
    pub sub_interval_30m: i64,
    /// Bucket width for indices routed at 2 hours
    pub sub_interval_2h: i64,
    /// First output timestamp (step aligned)
    pub fixed_start: i64,
    /// Last output timestamp (step aligned)
    pub fixed_end: i64,
    /// Series pagination offset
    pub offset: usize,
    /// Series pagination limit, `None` for all series
    pub limit: Option<usize>,
    /// Caller wants every series and no pagination metadata
    pub need_all_series: bool,
    /// Extra raw filter clauses supplied by the caller
    pub filters: Vec<serde_json::Value>,
    /// Model the expression belongs to (series identity cache key material)
    pub model_id: Option<String>,
    /// Log group the data lives in
    pub log_group: Option<String>,
    /// Preview evaluations never populate caches
    pub preview: bool,
    /// Never backfill gaps with previous samples
    pub no_fill: bool,
}

impl Query {
    /// Range query over `[start, end]` evaluated every `step`
    pub fn range(start: i64, end: i64, step: i64) -> Self {
        Self {
            start,
            end,
            step,
            is_instant: false,
            sub_interval_30m: 0,
            sub_interval_2h: 0,
            fixed_start: start,
            fixed_end: end,
            offset: 0,
            limit: None,
            need_all_series: true,
            filters: Vec::new(),
            model_id: None,
            log_group: None,
            preview: false,
            no_fill: false,
        }
    }

    /// Instant query at `end`; `end - start` is the client-provided lookback
    pub fn instant(start: i64, end: i64) -> Self {
        Self {
            is_instant: true,
            step: end - start,
            ..Self::range(start, end, end - start)
        }
    }

    /// Set the log group
    pub fn with_log_group(mut self, group: impl Into<String>) -> Self {
        self.log_group = Some(group.into());
        self
    }

    /// Set the model id
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Request one page of series
    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self.need_all_series = false;
        self
    }

    /// Add a raw filter clause
    pub fn with_filter(mut self, filter: serde_json::Value) -> Self {
        self.filters.push(filter);
        self
    }

    /// Mark as preview
    pub fn as_preview(mut self) -> Self {
        self.preview = true;
        self
    }

    /// Disable gap backfill
    pub fn without_fill(mut self) -> Self {
        self.no_fill = true;
        self
    }

    /// Whether results for this query may be written to the series identity cache
    pub fn is_cacheable(&self) -> bool {
        !self.preview && self.filters.is_empty()
    }
}

// ============================================================================
// Output
// ============================================================================

/// A single output sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Timestamp (ms)
    pub t: i64,
    /// Value
    pub v: f64,
}

impl Point {
    /// Create a point
    pub fn new(t: i64, v: f64) -> Self {
        Self { t, v }
    }
}

/// One output series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Series labels
    pub metric: Labels,
    /// Points in ascending timestamp order
    pub points: Vec<Point>,
}

/// Series ordered by series key
pub type Matrix = Vec<Series>;

/// A page of series plus the number of series the page was cut from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMatrix {
    /// Series on this page
    pub matrix: Matrix,
    /// Total candidate series
    pub total_series: usize,
}

/// Result of an evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryOutput {
    /// Every series, no pagination metadata
    Matrix(Matrix),
    /// One page with pagination metadata
    Page(PageMatrix),
}

impl QueryOutput {
    /// Series of the result regardless of shape
    pub fn matrix(&self) -> &Matrix {
        match self {
            QueryOutput::Matrix(m) => m,
            QueryOutput::Page(p) => &p.matrix,
        }
    }

    /// Total series when paginated
    pub fn total_series(&self) -> Option<usize> {
        match self {
            QueryOutput::Matrix(_) => None,
            QueryOutput::Page(p) => Some(p.total_series),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_unique() {
        let labels = Labels::from_pairs([("b", "1"), ("a", "2"), ("b", "3")]);
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(labels.get("b"), Some("3"));
        assert_eq!(labels.get("c"), None);
    }

    #[test]
    fn test_labels_str_parse_inverts_render() {
        let labels = Labels::from_pairs([("path", r#"/a"b\c"#), ("job", "api")]);
        let rendered = labels.to_labels_str();
        assert_eq!(rendered, r#"job="api",path="/a\"b\\c""#);
        assert_eq!(Labels::parse_labels_str(&rendered).unwrap(), labels);
        assert!(Labels::parse_labels_str("").unwrap().is_empty());
    }

    #[test]
    fn test_labels_str_malformed() {
        assert!(Labels::parse_labels_str("job=api").is_err());
        assert!(Labels::parse_labels_str(r#"job="api"#).is_err());
        assert!(Labels::parse_labels_str(r#"job="api"x"#).is_err());
        assert!(Labels::parse_labels_str(r#"job="api","#).is_err());
        assert!(Labels::parse_labels_str(r#"="api""#).is_err());
    }

    #[test]
    fn test_labels_str_empty_value_and_escapes() {
        let labels = Labels::parse_labels_str(r#"env="",path="a\\,b\"c""#).unwrap();
        assert_eq!(labels.get("env"), Some(""));
        assert_eq!(labels.get("path"), Some(r#"a\,b"c"#));
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let labels = Labels::from_pairs([("job", "api")]);
        let fp = labels.fingerprint();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(r#"job="api""#));
        assert_ne!(fp, Labels::from_pairs([("job", "web")]).fingerprint());
    }

    #[test]
    fn test_query_builders() {
        let q = Query::instant(1_000, 301_000).with_page(10, 5).with_log_group("g1");
        assert!(q.is_instant);
        assert_eq!(q.step, 300_000);
        assert_eq!(q.limit, Some(5));
        assert!(!q.need_all_series);
        assert!(q.is_cacheable());
        assert!(!q.clone().as_preview().is_cacheable());
        assert!(!q.with_filter(serde_json::json!({"term": {"env": "prod"}})).is_cacheable());
    }
}
