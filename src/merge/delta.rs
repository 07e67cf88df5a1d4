//! `delta` accumulator: first/last samples, no reset correction

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{earliest_sample, latest_sample, payload, sample_cmp, Accumulator};
use crate::bucket::RawBucket;
use crate::error::Result;

/// Gauge partial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaPoint {
    /// Earliest sample timestamp (ms)
    pub first_t: i64,
    /// Earliest sample value
    pub first_v: f64,
    /// Latest sample timestamp (ms)
    pub last_t: i64,
    /// Latest sample value
    pub last_v: f64,
    /// Samples covered
    pub count: u64,
}

impl Accumulator for DeltaPoint {
    type Params = ();

    fn from_bucket(bucket: &RawBucket, _: ()) -> Result<Option<Self>> {
        if bucket.doc_count == 0 {
            return Ok(None);
        }
        payload(bucket)
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        sample_cmp((self.first_t, self.first_v), (other.first_t, other.first_v))
            .then_with(|| sample_cmp((self.last_t, self.last_v), (other.last_t, other.last_v)))
            .then_with(|| self.count.cmp(&other.count))
    }

    fn merge(&mut self, other: Self, _: ()) {
        let first = earliest_sample((self.first_t, self.first_v), (other.first_t, other.first_v));
        let last = latest_sample((self.last_t, self.last_v), (other.last_t, other.last_v));
        *self = DeltaPoint {
            first_t: first.0,
            first_v: first.1,
            last_t: last.0,
            last_v: last.1,
            count: self.count + other.count,
        };
    }

    fn evaluate(&self, _: (), _: i64) -> Option<f64> {
        (self.count >= 2).then(|| self.last_v - self.first_v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(first: (i64, f64), last: (i64, f64), count: u64) -> DeltaPoint {
        DeltaPoint {
            first_t: first.0,
            first_v: first.1,
            last_t: last.0,
            last_v: last.1,
            count,
        }
    }

    #[test]
    fn test_delta_spans_partials_without_correction() {
        let mut merged = partial((60, 5.0), (110, 2.0), 2);
        merged.merge(partial((0, 10.0), (50, 40.0), 2), ());
        assert_eq!((merged.first_t, merged.last_t), (0, 110));
        assert_eq!(merged.count, 4);
        assert_eq!(merged.evaluate((), 0), Some(-8.0));
    }

    #[test]
    fn test_tie_takes_larger_value() {
        let mut merged = partial((0, 1.0), (10, 3.0), 2);
        merged.merge(partial((0, 2.0), (10, 4.0), 2), ());
        assert_eq!((merged.first_v, merged.last_v), (2.0, 4.0));
    }

    #[test]
    fn test_raw_difference_independent_of_range() {
        let mut merged = partial((0, 10.0), (50, 4.0), 2);
        merged.merge(partial((60, 3.0), (110, 7.0), 3), ());
        assert_eq!(merged.evaluate((), 60_000), Some(-3.0));
        assert_eq!(merged.evaluate((), 3_600_000), Some(-3.0));
    }

    #[test]
    fn test_needs_two_samples() {
        assert_eq!(partial((0, 1.0), (0, 1.0), 1).evaluate((), 0), None);
    }
}
