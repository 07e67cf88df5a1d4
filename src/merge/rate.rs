//! `rate` / `increase` accumulators
//!
//! Partials carry their first and last sample, the counter correction
//! accumulated inside them and their sample count. Joining two time-disjoint
//! partials adds the earlier one's last value whenever the later one starts
//! lower, modelling a reset to zero. Overlapping partials describe the same
//! samples and keep the larger correction and count.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{earliest_sample, latest_sample, payload, sample_cmp, Accumulator};
use crate::bucket::RawBucket;
use crate::error::Result;
use crate::operator::RateFn;

/// Reset-corrected counter partial
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatePoint {
    /// Earliest sample timestamp (ms)
    pub first_t: i64,
    /// Earliest sample value
    pub first_v: f64,
    /// Latest sample timestamp (ms)
    pub last_t: i64,
    /// Latest sample value
    pub last_v: f64,
    /// Sum of values lost to resets
    pub correction: f64,
    /// Samples covered
    pub count: u64,
}

impl RatePoint {
    /// Order two partials by start, the earlier first
    pub(crate) fn ordered(a: Self, b: Self) -> (Self, Self) {
        if a.canonical_cmp(&b) == Ordering::Greater {
            (b, a)
        } else {
            (a, b)
        }
    }
}

impl Accumulator for RatePoint {
    type Params = RateFn;

    fn from_bucket(bucket: &RawBucket, _: RateFn) -> Result<Option<Self>> {
        if bucket.doc_count == 0 {
            return Ok(None);
        }
        payload(bucket)
    }

    fn canonical_cmp(&self, other: &Self) -> Ordering {
        sample_cmp((self.first_t, self.first_v), (other.first_t, other.first_v))
            .then_with(|| sample_cmp((self.last_t, self.last_v), (other.last_t, other.last_v)))
            .then_with(|| self.correction.total_cmp(&other.correction))
            .then_with(|| self.count.cmp(&other.count))
    }

    fn merge(&mut self, other: Self, _: RateFn) {
        let (early, late) = Self::ordered(*self, other);
        let disjoint = late.first_t > early.last_t;

        let (correction, count) = if disjoint {
            let reset = if late.first_v < early.last_v { early.last_v } else { 0.0 };
            (early.correction + late.correction + reset, early.count + late.count)
        } else {
            (early.correction.max(late.correction), early.count.max(late.count))
        };

        let first = earliest_sample((early.first_t, early.first_v), (late.first_t, late.first_v));
        let last = latest_sample((early.last_t, early.last_v), (late.last_t, late.last_v));

        *self = RatePoint {
            first_t: first.0,
            first_v: first.1,
            last_t: last.0,
            last_v: last.1,
            correction,
            count,
        };
    }

    fn evaluate(&self, f: RateFn, range_ms: i64) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let increase = self.last_v - self.first_v + self.correction;
        match f {
            RateFn::Increase => Some(increase),
            RateFn::Rate if range_ms > 0 => Some(increase / (range_ms as f64 / 1000.0)),
            RateFn::Rate => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(first: (i64, f64), last: (i64, f64), correction: f64, count: u64) -> RatePoint {
        RatePoint {
            first_t: first.0,
            first_v: first.1,
            last_t: last.0,
            last_v: last.1,
            correction,
            count,
        }
    }

    #[test]
    fn test_reset_between_partials_adds_last_value() {
        let early = partial((0, 10.0), (50, 40.0), 0.0, 3);
        let late = partial((60, 5.0), (110, 25.0), 0.0, 3);

        let mut merged = early;
        merged.merge(late, RateFn::Increase);
        assert_eq!(merged.correction, 40.0);
        assert_eq!(merged.count, 6);
        // 25 - 10 + 40
        assert_eq!(merged.evaluate(RateFn::Increase, 120_000), Some(55.0));
        assert_eq!(merged.evaluate(RateFn::Rate, 120_000), Some(55.0 / 120.0));

        // Merge order does not matter
        let mut reversed = late;
        reversed.merge(early, RateFn::Increase);
        assert_eq!(reversed, merged);
    }

    #[test]
    fn test_no_reset_no_correction() {
        let mut merged = partial((0, 1.0), (50, 5.0), 2.0, 2);
        merged.merge(partial((60, 6.0), (90, 9.0), 0.0, 2), RateFn::Rate);
        assert_eq!(merged.correction, 2.0);
        assert_eq!((merged.first_v, merged.last_v), (1.0, 9.0));
    }

    #[test]
    fn test_overlapping_partials_take_max() {
        let a = partial((0, 1.0), (50, 5.0), 3.0, 4);
        let mut merged = a;
        merged.merge(a, RateFn::Increase);
        assert_eq!(merged, a);
    }

    #[test]
    fn test_first_sample_tie_takes_larger_value() {
        let low = partial((0, 1.0), (10, 5.0), 0.0, 2);
        let high = partial((0, 2.0), (10, 5.0), 0.0, 2);

        let mut merged = low;
        merged.merge(high, RateFn::Increase);
        assert_eq!(merged.first_v, 2.0);
        assert_eq!(merged.evaluate(RateFn::Increase, 60_000), Some(3.0));

        let mut reversed = high;
        reversed.merge(low, RateFn::Increase);
        assert_eq!(reversed, merged);
    }

    #[test]
    fn test_single_sample_yields_nothing() {
        let single = partial((10, 3.0), (10, 3.0), 0.0, 1);
        assert_eq!(single.evaluate(RateFn::Rate, 60_000), None);
    }
}
