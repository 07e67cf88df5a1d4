//! Query Window Normalizer
//!
//! Resolves the concrete range of an expression, the lookback window that has
//! to be fetched, and the sub-interval bucket widths used against indices
//! routed at 30 minutes and at 2 hours.
//!
//! Aggregation buckets must never straddle a routing boundary, otherwise
//! partial sums and first/last samples cannot be recombined. Both
//! sub-intervals therefore divide the step and the range exactly.
//!
//! ```text
//!   fetch start          FixedStart                     FixedEnd
//!       │◄──── range ────►│◄─ step ─►│        ...        │
//!       ├──┬──┬──┬──┬──┬──┼──┬──┬──┬─┼──┬──┬──┬──┬──┬──┬─┤
//!       └ sub-interval buckets, keys aligned to the fetch start
//! ```

use tracing::debug;

use crate::error::{Error, Result};
use crate::promql::{Expr, RangeSpec};
use crate::types::{Query, INSTANT_RANGE_GRANULARITY_MS, MINUTE_MS, ROUTING_2H_MS, ROUTING_30M_MS};

/// Outcome of normalization
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedWindow {
    /// Shallow copy of the query with the fetch window and derived fields set
    pub query: Query,
    /// Resolved range (ms)
    pub range: i64,
}

impl NormalizedWindow {
    /// Bucket offset aligning histogram keys to the fetch start
    pub fn bucket_offset(&self, sub_interval: i64) -> i64 {
        self.query.start.rem_euclid(sub_interval)
    }
}

/// Normalize `query` for `expr`, resolving an automatic range in place
///
/// # Errors
///
/// * `Exec` when the expression does not wrap a vector selector
/// * `BadData` for inverted windows, non-positive steps or ranges, and
///   instant ranges above two hours that are not a multiple of 5 minutes
pub fn normalize(query: &Query, expr: &mut Expr) -> Result<NormalizedWindow> {
    let (_, range_spec) = expr.selector()?;

    if query.start > query.end {
        return Err(Error::bad_data(format!(
            "start {} is after end {}",
            query.start, query.end
        )));
    }

    let range = if query.is_instant {
        match range_spec {
            RangeSpec::Auto => query.end - query.start,
            RangeSpec::Fixed(r) => r,
        }
    } else {
        if query.step <= 0 {
            return Err(Error::bad_data(format!(
                "step must be positive, got {}",
                query.step
            )));
        }
        match range_spec {
            RangeSpec::Auto => query.step,
            RangeSpec::Fixed(r) => r,
        }
    };

    if range <= 0 {
        return Err(Error::bad_data(format!("range must be positive, got {}", range)));
    }

    if query.is_instant && range > ROUTING_2H_MS && range % INSTANT_RANGE_GRANULARITY_MS != 0 {
        return Err(Error::bad_data(
            "if instant query and range > 2h, range should be a multiple of 5 minutes",
        ));
    }

    let mut normalized = query.clone();
    if query.is_instant {
        normalized.step = range;
        normalized.fixed_start = query.end;
        normalized.fixed_end = query.end;
        normalized.start = query.end - range;
        normalized.end = query.end;
    } else {
        normalized.fixed_start = query.start.div_euclid(query.step) * query.step;
        normalized.fixed_end = query.end.div_euclid(query.step) * query.step;
        normalized.start = normalized.fixed_start - range;
        normalized.end = normalized.fixed_end;
    }
    normalized.sub_interval_30m = sub_interval(range, normalized.step, ROUTING_30M_MS);
    normalized.sub_interval_2h = sub_interval(range, normalized.step, ROUTING_2H_MS);

    expr.resolve_range(range);

    debug!(
        instant = query.is_instant,
        range,
        step = normalized.step,
        sub_30m = normalized.sub_interval_30m,
        sub_2h = normalized.sub_interval_2h,
        fetch_start = normalized.start,
        fetch_end = normalized.end,
        "Normalized query window"
    );

    Ok(NormalizedWindow {
        query: normalized,
        range,
    })
}

/// Largest bucket width dividing both `range` and `step` within `bound`
///
/// Steps inside the bound use the plain gcd. Larger steps search downwards
/// from the bound in whole minutes, falling back to `gcd(gcd, bound)` which
/// always divides both.
pub fn sub_interval(range: i64, step: i64, bound: i64) -> i64 {
    let g = gcd(range, step);
    if step <= bound {
        return g;
    }

    let mut candidate = bound;
    while candidate >= MINUTE_MS {
        if step % candidate == 0 && range % candidate == 0 {
            return candidate;
        }
        candidate -= MINUTE_MS;
    }

    gcd(g, bound)
}

/// Greatest common divisor
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promql::VectorSelector;
    use crate::types::MINUTE_MS;

    fn matrix(range: RangeSpec) -> Expr {
        Expr::matrix(VectorSelector::new("http_requests_total"), range)
    }

    #[test]
    fn test_instant_auto_uses_client_delta() {
        let query = Query::instant(0, 5 * MINUTE_MS);
        let mut expr = matrix(RangeSpec::Auto);
        let w = normalize(&query, &mut expr).unwrap();

        assert_eq!(w.range, 5 * MINUTE_MS);
        assert_eq!(w.query.start, 0);
        assert_eq!(w.query.step, 5 * MINUTE_MS);
        assert_eq!(w.query.sub_interval_30m, 5 * MINUTE_MS);
        assert_eq!(expr.selector().unwrap().1, RangeSpec::Fixed(5 * MINUTE_MS));
    }

    #[test]
    fn test_instant_literal_range_sets_lookback() {
        let end = 10 * 3_600_000;
        let query = Query::instant(end - MINUTE_MS, end);
        let mut expr = matrix(RangeSpec::Fixed(60 * MINUTE_MS));
        let w = normalize(&query, &mut expr).unwrap();

        assert_eq!(w.query.start, end - 60 * MINUTE_MS);
        assert_eq!(w.query.fixed_end, end);
        assert_eq!(w.query.sub_interval_30m, 30 * MINUTE_MS);
        assert_eq!(w.query.sub_interval_2h, 60 * MINUTE_MS);
    }

    #[test]
    fn test_instant_long_range_must_be_multiple_of_five_minutes() {
        let query = Query::instant(0, 10 * 3_600_000);
        let mut expr = matrix(RangeSpec::Fixed(ROUTING_2H_MS + MINUTE_MS));
        let err = normalize(&query, &mut expr).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err
            .to_string()
            .contains("if instant query and range > 2h, range should be a multiple of 5 minutes"));

        let mut ok = matrix(RangeSpec::Fixed(ROUTING_2H_MS + 5 * MINUTE_MS));
        assert!(normalize(&query, &mut ok).is_ok());
    }

    #[test]
    fn test_range_auto_uses_step() {
        let query = Query::range(7 * MINUTE_MS, 60 * MINUTE_MS, 5 * MINUTE_MS);
        let mut expr = matrix(RangeSpec::Auto);
        let w = normalize(&query, &mut expr).unwrap();

        assert_eq!(w.range, 5 * MINUTE_MS);
        assert_eq!(w.query.fixed_start, 5 * MINUTE_MS);
        assert_eq!(w.query.fixed_end, 60 * MINUTE_MS);
        assert_eq!(w.query.start, 0);
        assert_eq!(w.query.end, 60 * MINUTE_MS);
    }

    #[test]
    fn test_sub_interval_small_step_is_gcd() {
        assert_eq!(sub_interval(10 * MINUTE_MS, 4 * MINUTE_MS, ROUTING_30M_MS), 2 * MINUTE_MS);
        assert_eq!(sub_interval(45_000, 30_000, ROUTING_30M_MS), 15_000);
    }

    #[test]
    fn test_sub_interval_large_step_searches_down() {
        // step 1h, range 3h: 30m divides both
        assert_eq!(sub_interval(180 * MINUTE_MS, 60 * MINUTE_MS, ROUTING_30M_MS), 30 * MINUTE_MS);
        // step 3h, range 3h: 2h does not divide, 90m does
        assert_eq!(sub_interval(180 * MINUTE_MS, 180 * MINUTE_MS, ROUTING_2H_MS), 90 * MINUTE_MS);
        // step 70m, range 140m: 30m fails, 14m is the largest minute divisor of 70m within 30m
        assert_eq!(sub_interval(140 * MINUTE_MS, 70 * MINUTE_MS, ROUTING_30M_MS), 14 * MINUTE_MS);
    }

    #[test]
    fn test_sub_interval_fallback_divides_both() {
        let range = 3_600_000 + 1_000;
        let step = 3_600_000 + 1_000;
        let sub = sub_interval(range, step, ROUTING_30M_MS);
        assert!(sub <= ROUTING_30M_MS);
        assert_eq!(range % sub, 0);
        assert_eq!(step % sub, 0);
    }

    #[test]
    fn test_invalid_windows() {
        let mut expr = matrix(RangeSpec::Auto);
        assert!(normalize(&Query::range(10, 0, 1), &mut expr).is_err());
        assert!(normalize(&Query::range(0, 10, 0), &mut expr).is_err());
        assert!(normalize(&Query::instant(10, 10), &mut expr).is_err());
        let mut negative = matrix(RangeSpec::Fixed(-5));
        assert!(normalize(&Query::range(0, 10, 1), &mut negative).is_err());
    }

    #[test]
    fn test_bucket_offset_aligns_to_fetch_start() {
        let query = Query::instant(0, 3 * MINUTE_MS + 7_000);
        let mut expr = matrix(RangeSpec::Fixed(2 * MINUTE_MS));
        let w = normalize(&query, &mut expr).unwrap();
        assert_eq!(w.query.start, MINUTE_MS + 7_000);
        assert_eq!(w.bucket_offset(w.query.sub_interval_30m), MINUTE_MS + 7_000);
    }
}
