//! Operator Merge Engines
//!
//! Per-shard histogram buckets are turned into output points in two phases:
//!
//! 1. **Dedup**: buckets sharing a key (one per shard or index holding data
//!    for that slice) are folded into a single accumulator. Partials are
//!    sorted by a canonical total order first, so the result does not depend
//!    on the order in which shards answered.
//! 2. **Compose**: for every output timestamp `T` on the step grid, the
//!    accumulators with keys in `[T - range, T)` are folded in time order and
//!    evaluated by the operator's formula.
//!
//! Each operator family owns an accumulator type implementing
//! [`Accumulator`]; [`merge_series`] dispatches on [`Operator`].

pub mod changes;
pub mod delta;
pub mod irate;
pub mod over_time;
pub mod rate;
pub mod sampling;

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::bucket::RawBucket;
use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::operator::Operator;
use crate::pool::WorkerPool;
use crate::types::{Point, Query};

pub use changes::ChangesPoint;
pub use delta::DeltaPoint;
pub use irate::IratePoint;
pub use over_time::AggPoint;
pub use rate::RatePoint;
pub use sampling::SamplePoint;

/// Partial aggregate of one operator family
pub trait Accumulator: Sized + Clone + Send + 'static {
    /// Operator parameters threaded through every call
    type Params: Copy + Send + Sync + 'static;

    /// Decode one histogram bucket; `None` when it holds no samples
    fn from_bucket(bucket: &RawBucket, params: Self::Params) -> Result<Option<Self>>;

    /// Total order used to fold partials deterministically
    fn canonical_cmp(&self, other: &Self) -> Ordering;

    /// Absorb another partial
    fn merge(&mut self, other: Self, params: Self::Params);

    /// Final value over a window of `range_ms`
    fn evaluate(&self, params: Self::Params, range_ms: i64) -> Option<f64>;
}

/// Output grid of a merge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeWindow {
    /// First output timestamp
    pub start: i64,
    /// Last output timestamp
    pub end: i64,
    /// Distance between output timestamps
    pub step: i64,
    /// Width of the window ending at each output timestamp
    pub range: i64,
    /// Single output at `end`
    pub instant: bool,
}

impl MergeWindow {
    /// Grid of a normalized query
    pub fn from_query(query: &Query, range: i64) -> Self {
        Self {
            start: query.fixed_start,
            end: query.fixed_end,
            step: query.step,
            range,
            instant: query.is_instant,
        }
    }

    /// Output timestamps in ascending order
    pub fn output_times(&self) -> impl Iterator<Item = i64> {
        let (first, step) = if self.instant || self.step <= 0 {
            (self.end, 1)
        } else {
            (self.start, self.step)
        };
        let end = self.end;
        std::iter::successors(Some(first), move |t| Some(t + step)).take_while(move |t| *t <= end)
    }
}

/// Gap backfill settings of the sampling engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillPolicy {
    /// Whether gaps may be filled at all for this query
    pub enabled: bool,
    /// Maximum age of a reused sample (ms)
    pub lookback_ms: i64,
}

impl FillPolicy {
    /// Policy for a normalized query
    pub fn for_query(query: &Query, config: &QueryConfig) -> Self {
        Self {
            enabled: !query.no_fill && !query.is_instant && query.step <= config.fill_interval_threshold_ms,
            lookback_ms: config.lookback_delta_ms,
        }
    }

    /// Never fill
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            lookback_ms: 0,
        }
    }
}

/// Everything a per-series merge needs besides the buckets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeContext {
    /// Operator
    pub op: Operator,
    /// Output grid
    pub window: MergeWindow,
    /// Sampling backfill
    pub fill: FillPolicy,
}

// ============================================================================
// Phases
// ============================================================================

fn fold<A: Accumulator>(parts: impl IntoIterator<Item = A>, params: A::Params) -> Option<A> {
    let mut parts = parts.into_iter();
    let mut acc = parts.next()?;
    for part in parts {
        acc.merge(part, params);
    }
    Some(acc)
}

/// Fold same-key buckets of every shard into one accumulator per key
pub fn dedup<A: Accumulator>(raw: &[Vec<RawBucket>], params: A::Params) -> Result<BTreeMap<i64, A>> {
    let mut partials: BTreeMap<i64, Vec<A>> = BTreeMap::new();
    for buckets in raw {
        for bucket in buckets {
            if let Some(partial) = A::from_bucket(bucket, params)? {
                partials.entry(bucket.key).or_default().push(partial);
            }
        }
    }

    Ok(partials
        .into_iter()
        .filter_map(|(key, mut parts)| {
            parts.sort_by(A::canonical_cmp);
            fold(parts, params).map(|acc| (key, acc))
        })
        .collect())
}

/// Walk the output grid, folding the accumulators inside each window
pub fn compose<A: Accumulator>(
    buckets: &BTreeMap<i64, A>,
    window: &MergeWindow,
    params: A::Params,
) -> Vec<Point> {
    window
        .output_times()
        .filter_map(|t| {
            let acc = fold(
                buckets.range(t - window.range..t).map(|(_, a)| a.clone()),
                params,
            )?;
            acc.evaluate(params, window.range).map(|v| Point::new(t, v))
        })
        .collect()
}

fn run<A: Accumulator>(raw: &[Vec<RawBucket>], window: &MergeWindow, params: A::Params) -> Result<Vec<Point>> {
    let buckets = dedup::<A>(raw, params)?;
    Ok(compose(&buckets, window, params))
}

/// Merge the per-shard buckets of one series into its output points
pub fn merge_series(raw: &[Vec<RawBucket>], ctx: &MergeContext) -> Result<Vec<Point>> {
    match ctx.op {
        Operator::Sampling => sampling::merge(raw, &ctx.window, ctx.fill),
        Operator::OverTime(f) => run::<AggPoint>(raw, &ctx.window, f),
        Operator::Rate(f) => run::<RatePoint>(raw, &ctx.window, f),
        Operator::Irate => run::<IratePoint>(raw, &ctx.window, ()),
        Operator::Changes => run::<ChangesPoint>(raw, &ctx.window, ()),
        Operator::Delta => run::<DeltaPoint>(raw, &ctx.window, ()),
    }
}

/// Merge every series, dropping those without points
///
/// Instant queries merge serially. Range queries run one task per series on
/// `pool`. Output is sorted by series key.
pub async fn merge_all(
    series: Vec<(String, Vec<Vec<RawBucket>>)>,
    ctx: MergeContext,
    pool: &WorkerPool,
    cancel_on_error: bool,
) -> Result<Vec<(String, Vec<Point>)>> {
    let total = series.len();
    let op = ctx.op;
    let mut merged = if ctx.window.instant {
        let mut out = Vec::with_capacity(total);
        for (key, raw) in series {
            out.push((key, merge_series(&raw, &ctx)?));
        }
        out
    } else {
        let ctx = Arc::new(ctx);
        let mut group = pool.group(cancel_on_error);
        for (key, raw) in series {
            let ctx = Arc::clone(&ctx);
            group
                .spawn(async move {
                    let points = merge_series(&raw, &ctx)?;
                    Ok((key, points))
                })
                .await
                .map_err(|e| Error::exec(format!("merge submission failed: {}", e)))?;
        }
        group.join().await?
    };

    merged.retain(|(_, points)| !points.is_empty());
    merged.sort_by(|a, b| a.0.cmp(&b.0));
    metrics::record_merged_series(merged.len());
    debug!(op = %op, series = total, emitted = merged.len(), "Merged series");
    Ok(merged)
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Serde adapter mapping JSON `null` to NaN
pub(crate) mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

/// Decode a bucket payload, mapping failures to internal errors
pub(crate) fn payload<T: serde::de::DeserializeOwned>(bucket: &RawBucket) -> Result<Option<T>> {
    if bucket.value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(bucket.value.clone())
        .map(Some)
        .map_err(|e| Error::internal(format!("malformed bucket payload at {}: {}", bucket.key, e)))
}

/// `(t, v)` ordering: later timestamp wins, ties go to the larger value
pub(crate) fn sample_cmp(a: (i64, f64), b: (i64, f64)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.total_cmp(&b.1))
}

/// Earlier of two first samples; on equal timestamps the larger value
pub(crate) fn earliest_sample(a: (i64, f64), b: (i64, f64)) -> (i64, f64) {
    match a.0.cmp(&b.0) {
        Ordering::Less => a,
        Ordering::Greater => b,
        Ordering::Equal => (a.0, a.1.max(b.1)),
    }
}

/// Later of two last samples; on equal timestamps the larger value
pub(crate) fn latest_sample(a: (i64, f64), b: (i64, f64)) -> (i64, f64) {
    if sample_cmp(b, a) == Ordering::Greater {
        b
    } else {
        a
    }
}

/// Whether two consecutive values count as a change; NaN equals NaN
pub(crate) fn values_differ(a: f64, b: f64) -> bool {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => false,
        (true, false) | (false, true) => true,
        (false, false) => a != b,
    }
}
