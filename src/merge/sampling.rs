//! Plain instant-vector sampling
//!
//! Each bucket carries its latest sample. Within a window the latest sample
//! wins, ties going to the larger value. Empty windows may reuse the
//! previous sample when the fill policy allows and the sample is recent
//! enough.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{dedup, payload, sample_cmp, Accumulator, FillPolicy, MergeWindow};
use crate::bucket::RawBucket;
use crate::error::Result;
use crate::types::Point;

/// Latest sample of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    /// Original sample timestamp (ms)
    pub t: i64,
    /// Sample value
    #[serde(with = "super::nan_as_null")]
    pub v: f64,
}

impl Accumulator for SamplePoint {
    type Params = ();

    fn from_bucket(bucket: &RawBucket, _: ()) -> Result<Option<Self>> {
        if bucket.doc_count == 0 {
            return Ok(None);
        }
        payload(bucket)
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        sample_cmp((self.t, self.v), (other.t, other.v))
    }

    fn merge(&mut self, other: Self, _: ()) {
        if other.canonical_cmp(self) == Ordering::Greater {
            *self = other;
        }
    }

    fn evaluate(&self, _: (), _: i64) -> Option<f64> {
        Some(self.v)
    }
}

/// Sampling merge with optional backfill
pub fn merge(raw: &[Vec<RawBucket>], window: &MergeWindow, fill: FillPolicy) -> Result<Vec<Point>> {
    let buckets: BTreeMap<i64, SamplePoint> = dedup(raw, ())?;
    let mut previous: Option<SamplePoint> = None;
    let mut points = Vec::new();

    for t in window.output_times() {
        let latest = buckets
            .range(t - window.range..t)
            .map(|(_, s)| *s)
            .max_by(|a, b| a.canonical_cmp(b));

        match latest {
            Some(sample) => {
                points.push(Point::new(t, sample.v));
                previous = Some(sample);
            },
            None => {
                if let Some(prev) = previous.filter(|p| fill.enabled && t - p.t <= fill.lookback_ms) {
                    points.push(Point::new(t, prev.v));
                }
            },
        }
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bucket(key: i64, t: i64, v: f64) -> RawBucket {
        RawBucket { key, doc_count: 1, value: json!({"t": t, "v": v}) }
    }

    fn window(start: i64, end: i64, step: i64) -> MergeWindow {
        MergeWindow { start, end, step, range: step, instant: false }
    }

    #[test]
    fn test_larger_timestamp_wins_then_larger_value() {
        let raw = vec![
            vec![bucket(0, 10, 1.0), bucket(60, 70, 5.0)],
            vec![bucket(0, 20, 2.0), bucket(60, 70, 7.0)],
        ];
        let points = merge(&raw, &window(60, 120, 60), FillPolicy::disabled()).unwrap();
        assert_eq!(points, vec![Point::new(60, 2.0), Point::new(120, 7.0)]);
    }

    #[test]
    fn test_gap_backfill_within_lookback() {
        let raw = vec![vec![bucket(0, 50, 3.0)]];
        let fill = FillPolicy { enabled: true, lookback_ms: 100 };
        let points = merge(&raw, &window(60, 240, 60), fill).unwrap();
        // 60: sample, 120: 70ms old, 180: 130ms old -> stop
        assert_eq!(points, vec![Point::new(60, 3.0), Point::new(120, 3.0)]);

        let points = merge(&raw, &window(60, 240, 60), FillPolicy::disabled()).unwrap();
        assert_eq!(points, vec![Point::new(60, 3.0)]);
    }

    #[test]
    fn test_instant_retimestamps_to_end() {
        let raw = vec![vec![bucket(0, 10, 1.0), bucket(30, 45, 9.0)]];
        let w = MergeWindow { start: 60, end: 60, step: 60, range: 60, instant: true };
        let points = merge(&raw, &w, FillPolicy::disabled()).unwrap();
        assert_eq!(points, vec![Point::new(60, 9.0)]);
    }

    #[test]
    fn test_empty_bucket_ignored() {
        let raw = vec![vec![RawBucket { key: 0, doc_count: 0, value: json!(null) }]];
        assert!(merge(&raw, &window(60, 60, 60), FillPolicy::disabled()).unwrap().is_empty());
    }
}
