//! `*_over_time` accumulators
//!
//! A bucket reports its document count and one value: the sum for
//! `sum`/`avg`, the extreme for `max`/`min`. `count` uses the document count
//! alone. A missing extreme is NaN and never wins a comparison.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{payload, Accumulator};
use crate::bucket::RawBucket;
use crate::error::Result;
use crate::operator::OverTimeFn;

/// Running count and value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggPoint {
    /// Samples aggregated
    pub count: u64,
    /// Sum or extreme of the samples
    #[serde(with = "super::nan_as_null")]
    pub value: f64,
}

impl Accumulator for AggPoint {
    type Params = OverTimeFn;

    fn from_bucket(bucket: &RawBucket, f: OverTimeFn) -> Result<Option<Self>> {
        if bucket.doc_count == 0 {
            return Ok(None);
        }
        let value = match f {
            OverTimeFn::Count => bucket.doc_count as f64,
            _ => payload::<f64>(bucket)?.unwrap_or(f64::NAN),
        };
        Ok(Some(AggPoint {
            count: bucket.doc_count,
            value,
        }))
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.count
            .cmp(&other.count)
            .then_with(|| self.value.total_cmp(&other.value))
    }

    fn merge(&mut self, other: Self, f: OverTimeFn) {
        self.value = match f {
            OverTimeFn::Sum | OverTimeFn::Avg | OverTimeFn::Count => self.value + other.value,
            OverTimeFn::Max if self.value.is_nan() || other.value > self.value => other.value,
            OverTimeFn::Min if self.value.is_nan() || other.value < self.value => other.value,
            OverTimeFn::Max | OverTimeFn::Min => self.value,
        };
        self.count += other.count;
    }

    fn evaluate(&self, f: OverTimeFn, _: i64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        match f {
            OverTimeFn::Avg => Some(self.value / self.count as f64),
            OverTimeFn::Max | OverTimeFn::Min if self.value.is_nan() => None,
            _ => Some(self.value),
        }
    }
}
