//! `changes` accumulator
//!
//! Two time-disjoint partials sum their change counts plus one if the value
//! moved across the boundary. Overlapping partials keep the larger count.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{earliest_sample, latest_sample, payload, sample_cmp, values_differ, Accumulator};
use crate::bucket::RawBucket;
use crate::error::Result;

/// First/last sample and the changes between them
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChangesPoint {
    /// Earliest sample timestamp (ms)
    pub first_t: i64,
    /// Earliest sample value
    #[serde(with = "super::nan_as_null")]
    pub first_v: f64,
    /// Latest sample timestamp (ms)
    pub last_t: i64,
    /// Latest sample value
    #[serde(with = "super::nan_as_null")]
    pub last_v: f64,
    /// Value changes observed
    pub changes: u64,
}

impl Accumulator for ChangesPoint {
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
            .then_with(|| self.changes.cmp(&other.changes))
    }

    fn merge(&mut self, other: Self, _: ()) {
        let (early, late) = if self.canonical_cmp(&other) == Ordering::Greater {
            (other, *self)
        } else {
            (*self, other)
        };

        let changes = if late.first_t > early.last_t {
            early.changes + late.changes + u64::from(values_differ(early.last_v, late.first_v))
        } else {
            early.changes.max(late.changes)
        };

        let first = earliest_sample((early.first_t, early.first_v), (late.first_t, late.first_v));
        let last = latest_sample((early.last_t, early.last_v), (late.last_t, late.last_v));

        *self = ChangesPoint {
            first_t: first.0,
            first_v: first.1,
            last_t: last.0,
            last_v: last.1,
            changes,
        };
    }

    fn evaluate(&self, _: (), _: i64) -> Option<f64> {
        Some(self.changes as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(first: (i64, f64), last: (i64, f64), changes: u64) -> ChangesPoint {
        ChangesPoint {
            first_t: first.0,
            first_v: first.1,
            last_t: last.0,
            last_v: last.1,
            changes,
        }
    }

    #[test]
    fn test_equal_boundary_adds_nothing() {
        let earlier = partial((0, 3.0), (50, 8.0), 2);
        let later = partial((60, 8.0), (110, 10.0), 2);
        let mut merged = later;
        merged.merge(earlier, ());
        assert_eq!(merged.evaluate((), 0), Some(4.0));
        assert_eq!((merged.first_t, merged.last_t), (0, 110));
    }

    #[test]
    fn test_boundary_change_counts_once() {
        let mut merged = partial((0, 1.0), (10, 1.0), 0);
        merged.merge(partial((20, 2.0), (30, 2.0), 0), ());
        assert_eq!(merged.changes, 1);
    }

    #[test]
    fn test_nan_boundaries() {
        let mut nan_nan = partial((0, 1.0), (10, f64::NAN), 1);
        nan_nan.merge(partial((20, f64::NAN), (30, f64::NAN), 0), ());
        assert_eq!(nan_nan.changes, 1);

        let mut nan_value = partial((0, 1.0), (10, f64::NAN), 1);
        nan_value.merge(partial((20, 4.0), (30, 4.0), 0), ());
        assert_eq!(nan_value.changes, 2);
    }

    #[test]
    fn test_first_sample_tie_takes_larger_value() {
        let low = partial((0, 1.0), (10, 5.0), 1);
        let high = partial((0, 2.0), (10, 5.0), 1);

        let mut merged = low;
        merged.merge(high, ());
        assert_eq!((merged.first_t, merged.first_v), (0, 2.0));
        assert_eq!((merged.last_t, merged.last_v), (10, 5.0));

        let mut reversed = high;
        reversed.merge(low, ());
        assert_eq!(reversed, merged);
    }

    #[test]
    fn test_overlap_takes_larger_count() {
        let mut merged = partial((0, 1.0), (50, 3.0), 2);
        merged.merge(partial((20, 2.0), (50, 3.0), 1), ());
        assert_eq!(merged.changes, 2);
        assert_eq!(merged.first_t, 0);
    }
}
