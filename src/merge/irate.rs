//! `irate` accumulator
//!
//! Keeps only the two most recent samples with distinct timestamps. The
//! value is computed from those two alone.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{payload, sample_cmp, Accumulator};
use crate::bucket::RawBucket;
use crate::error::Result;

/// Two most recent samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IratePoint {
    /// Second most recent timestamp, if any
    #[serde(default)]
    pub previous_t: Option<i64>,
    /// Second most recent value
    #[serde(default)]
    pub previous_v: Option<f64>,
    /// Most recent timestamp
    pub last_t: i64,
    /// Most recent value
    pub last_v: f64,
}

impl IratePoint {
    fn samples(&self) -> impl Iterator<Item = (i64, f64)> {
        let previous = self.previous_t.zip(self.previous_v);
        previous.into_iter().chain(std::iter::once((self.last_t, self.last_v)))
    }
}

impl Accumulator for IratePoint {
    type Params = ();

    fn from_bucket(bucket: &RawBucket, _: ()) -> Result<Option<Self>> {
        if bucket.doc_count == 0 {
            return Ok(None);
        }
        payload(bucket)
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        sample_cmp((self.last_t, self.last_v), (other.last_t, other.last_v)).then_with(|| {
            let a = self.previous_t.zip(self.previous_v).unwrap_or((i64::MIN, f64::NEG_INFINITY));
            let b = other.previous_t.zip(other.previous_v).unwrap_or((i64::MIN, f64::NEG_INFINITY));
            sample_cmp(a, b)
        })
    }

    fn merge(&mut self, other: Self, _: ()) {
        let mut samples: Vec<(i64, f64)> = self.samples().chain(other.samples()).collect();
        // Newest first; equal timestamps keep the larger value only
        samples.sort_by(|a, b| sample_cmp(*b, *a));
        samples.dedup_by_key(|s| s.0);

        let last = samples[0];
        let previous = samples.get(1).copied();
        *self = IratePoint {
            previous_t: previous.map(|p| p.0),
            previous_v: previous.map(|p| p.1),
            last_t: last.0,
            last_v: last.1,
        };
    }

    fn evaluate(&self, _: (), _: i64) -> Option<f64> {
        let (pt, pv) = self.previous_t.zip(self.previous_v)?;
        let interval = self.last_t - pt;
        if interval == 0 {
            return None;
        }
        let delta = if self.last_v < pv { self.last_v } else { self.last_v - pv };
        Some(delta / (interval as f64 / 1000.0))
    }
}
