//! Typed decoding of nested aggregation responses
//!
//! A search response carries one terms aggregation per group-by field,
//! nested in group-by order, each named after its field. The innermost
//! level optionally holds a fixed-interval histogram named
//! [`HISTOGRAM_AGG`] whose buckets carry an operator-specific `value`
//! payload.
//!
//! ```text
//! aggregations
//! └─ __tsid            { buckets: [ { key, doc_count, ...children } ] }
//!    └─ __labels_str   { buckets: [ ... ] }
//!       └─ histogram   { buckets: [ { key: ts, doc_count, value } ] }
//! ```
//!
//! Every path from the root to a leaf becomes one [`DecodedSeries`]. The
//! series key is accumulated level by level: a `__tsid` level sets it
//! directly, a `__labels_str` level is rehashed into the same fingerprint
//! space, and any other field contributes a `name=value` part.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{fingerprint, Labels, Tsid, LABELS_STR_FIELD, TSID_FIELD};

/// Name of the histogram aggregation at the leaf level
pub const HISTOGRAM_AGG: &str = "histogram";

/// One histogram bucket of one series on one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBucket {
    /// Bucket start (ms)
    pub key: i64,
    /// Documents in the bucket
    #[serde(default)]
    pub doc_count: u64,
    /// Operator-specific payload
    #[serde(default)]
    pub value: Value,
}

/// Search response envelope
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    /// Top-level aggregations by name
    #[serde(default)]
    pub aggregations: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct TermsAgg {
    #[serde(default)]
    buckets: Vec<TermsBucket>,
}

#[derive(Debug, Deserialize)]
struct TermsBucket {
    key: Value,
    #[serde(flatten)]
    children: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct HistogramAgg {
    #[serde(default)]
    buckets: Vec<RawBucket>,
}

/// One series extracted from a response
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSeries {
    /// Series key (fingerprint, or joined field parts)
    pub key: String,
    /// Fingerprint when one of the levels provided it
    pub tsid: Option<Tsid>,
    /// Labels gathered from the levels
    pub labels: Labels,
    /// Histogram buckets, empty for listing requests
    pub buckets: Vec<RawBucket>,
}

#[derive(Default, Clone)]
struct KeyState {
    tsid: Option<Tsid>,
    labels: Labels,
    parts: Vec<String>,
}

impl KeyState {
    fn push(&mut self, field: &str, value: &str) -> Result<()> {
        match field {
            TSID_FIELD => self.tsid = Some(value.to_string()),
            LABELS_STR_FIELD => {
                for label in Labels::parse_labels_str(value)?.iter() {
                    self.labels.insert(label.name.clone(), label.value.clone());
                }
                if self.tsid.is_none() {
                    self.tsid = Some(fingerprint(value));
                }
            },
            _ => {
                self.labels.insert(field, value);
                self.parts.push(format!("{}={}", field, value));
            },
        }
        Ok(())
    }

    fn key(&self) -> String {
        match &self.tsid {
            Some(tsid) => tsid.clone(),
            None => self.parts.join(","),
        }
    }
}

/// Decode a raw response body for the given group-by fields
pub fn decode(body: &[u8], group_by: &[String]) -> Result<Vec<DecodedSeries>> {
    let response: SearchResponse = serde_json::from_slice(body)?;
    decode_response(response, group_by)
}

/// Decode an already parsed response
pub fn decode_response(mut response: SearchResponse, group_by: &[String]) -> Result<Vec<DecodedSeries>> {
    let mut out = Vec::new();
    let Some(first) = group_by.first() else {
        return Ok(out);
    };
    let Some(root) = response.aggregations.remove(first) else {
        return Ok(out);
    };
    walk(root, group_by, 0, KeyState::default(), &mut out)?;
    Ok(out)
}

fn walk(
    node: Value,
    group_by: &[String],
    level: usize,
    state: KeyState,
    out: &mut Vec<DecodedSeries>,
) -> Result<()> {
    let field = &group_by[level];
    let terms: TermsAgg = serde_json::from_value(node)
        .map_err(|e| Error::internal(format!("malformed '{}' aggregation: {}", field, e)))?;

    for mut bucket in terms.buckets {
        let mut next = state.clone();
        next.push(field, &key_string(&bucket.key)?)?;

        if level + 1 < group_by.len() {
            if let Some(child) = bucket.children.remove(&group_by[level + 1]) {
                walk(child, group_by, level + 1, next, out)?;
            }
            continue;
        }

        let buckets = match bucket.children.remove(HISTOGRAM_AGG) {
            Some(histogram) => {
                let histogram: HistogramAgg = serde_json::from_value(histogram)
                    .map_err(|e| Error::internal(format!("malformed histogram: {}", e)))?;
                histogram.buckets
            },
            None => Vec::new(),
        };

        out.push(DecodedSeries {
            key: next.key(),
            tsid: next.tsid,
            labels: next.labels,
            buckets,
        });
    }
    Ok(())
}

fn key_string(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(Error::internal(format!("unsupported bucket key: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tsid_then_labels_str() {
        let body = json!({
            "aggregations": {
                "__tsid": {"buckets": [
                    {"key": "00000000000000aa", "doc_count": 3, "__labels_str": {"buckets": [
                        {"key": "job=\"api\"", "doc_count": 3, "histogram": {"buckets": [
                            {"key": 0, "doc_count": 2, "value": {"sum": 4.0}},
                            {"key": 60000, "doc_count": 1, "value": {"sum": 1.0}}
                        ]}}
                    ]}}
                ]}
            }
        });
        let series = decode(body.to_string().as_bytes(), &fields(&["__tsid", "__labels_str"])).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].key, "00000000000000aa");
        assert_eq!(series[0].labels.get("job"), Some("api"));
        assert_eq!(series[0].buckets.len(), 2);
        assert_eq!(series[0].buckets[1].key, 60000);
    }

    #[test]
    fn test_labels_str_is_rehashed() {
        let body = json!({
            "aggregations": {
                "__labels_str": {"buckets": [
                    {"key": "job=\"api\"", "doc_count": 1},
                    {"key": "job=\"web\"", "doc_count": 1}
                ]}
            }
        });
        let series = decode(body.to_string().as_bytes(), &fields(&["__labels_str"])).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].key, fingerprint(r#"job="api""#));
        assert_eq!(series[0].tsid.as_deref(), Some(series[0].key.as_str()));
        assert!(series[0].buckets.is_empty());
    }

    #[test]
    fn test_plain_fields_join_parts() {
        let body = json!({
            "aggregations": {
                "host": {"buckets": [
                    {"key": "a", "code": {"buckets": [{"key": 500}, {"key": 200}]}}
                ]}
            }
        });
        let series = decode(body.to_string().as_bytes(), &fields(&["host", "code"])).unwrap();
        let keys: Vec<&str> = series.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["host=a,code=500", "host=a,code=200"]);
        assert_eq!(series[0].labels.get("code"), Some("500"));
    }

    #[test]
    fn test_missing_aggregations_is_empty() {
        let series = decode(br#"{"hits": {}}"#, &fields(&["__tsid"])).unwrap();
        assert!(series.is_empty());
    }

    #[test]
    fn test_malformed_body() {
        assert!(decode(b"not json", &fields(&["__tsid"])).is_err());
        let body = json!({"aggregations": {"__tsid": {"buckets": [{"key": {"nested": 1}}]}}});
        let err = decode(body.to_string().as_bytes(), &fields(&["__tsid"])).unwrap_err();
        assert_eq!(err.status_code(), 500);
    }
}
