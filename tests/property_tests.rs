//! Property Tests for Windowing and Merging
//!
//! Uses property-based testing (proptest) to check the invariants the merge
//! engines rely on: sub-intervals that divide both step and range, and
//! results that do not depend on the order shards answered in.

use kuba_shardquery::{
    bucket::RawBucket,
    merge::{merge_series, FillPolicy, MergeContext, MergeWindow},
    operator::{OverTimeFn, RateFn},
    types::{MINUTE_MS, ROUTING_2H_MS, ROUTING_30M_MS},
    window::sub_interval,
    Operator,
};
use proptest::prelude::*;
use serde_json::json;

// =============================================================================
// Test Data Strategies
// =============================================================================

/// Whole-second durations between 1s and 6h
fn duration_ms() -> impl Strategy<Value = i64> {
    (1i64..=21_600).prop_map(|s| s * 1_000)
}

/// Sorted distinct sample timestamps within one minute-aligned bucket span
fn samples() -> impl Strategy<Value = Vec<(i64, f64)>> {
    prop::collection::btree_map(0i64..600, 0.0..1_000.0f64, 2..40)
        .prop_map(|m| m.into_iter().map(|(t, v)| (t * 1_000, v.round())).collect())
}

fn operator() -> impl Strategy<Value = Operator> {
    prop_oneof![
        Just(Operator::OverTime(OverTimeFn::Sum)),
        Just(Operator::OverTime(OverTimeFn::Max)),
        Just(Operator::OverTime(OverTimeFn::Count)),
        Just(Operator::Rate(RateFn::Increase)),
        Just(Operator::Changes),
        Just(Operator::Delta),
        Just(Operator::Irate),
    ]
}

/// Partial payload of one shard's slice of a bucket
fn payload(op: Operator, slice: &[(i64, f64)]) -> RawBucket {
    let first = slice[0];
    let last = slice[slice.len() - 1];
    let count = slice.len() as u64;
    let value = match op {
        Operator::OverTime(OverTimeFn::Max) => json!(slice.iter().map(|s| s.1).fold(f64::MIN, f64::max)),
        Operator::OverTime(_) => json!(slice.iter().map(|s| s.1).sum::<f64>()),
        Operator::Rate(_) => {
            let correction: f64 = slice.windows(2).filter(|w| w[1].1 < w[0].1).map(|w| w[0].1).sum();
            json!({"first_t": first.0, "first_v": first.1, "last_t": last.0, "last_v": last.1,
                   "correction": correction, "count": count})
        },
        Operator::Changes => {
            let changes = slice.windows(2).filter(|w| w[0].1 != w[1].1).count();
            json!({"first_t": first.0, "first_v": first.1, "last_t": last.0, "last_v": last.1, "changes": changes})
        },
        Operator::Delta => {
            json!({"first_t": first.0, "first_v": first.1, "last_t": last.0, "last_v": last.1, "count": count})
        },
        Operator::Irate => {
            let previous = slice.iter().rev().find(|s| s.0 < last.0).copied();
            json!({"previous_t": previous.map(|p| p.0), "previous_v": previous.map(|p| p.1),
                   "last_t": last.0, "last_v": last.1})
        },
        Operator::Sampling => json!({"t": last.0, "v": last.1}),
    };
    RawBucket { key: 0, doc_count: count, value }
}

fn context(op: Operator) -> MergeContext {
    MergeContext {
        op,
        window: MergeWindow {
            start: 10 * MINUTE_MS,
            end: 10 * MINUTE_MS,
            step: 10 * MINUTE_MS,
            range: 10 * MINUTE_MS,
            instant: true,
        },
        fill: FillPolicy::disabled(),
    }
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_sub_interval_divides_step_and_range(range in duration_ms(), step in duration_ms()) {
        for bound in [ROUTING_30M_MS, ROUTING_2H_MS] {
            let sub = sub_interval(range, step, bound);
            prop_assert!(sub > 0);
            prop_assert_eq!(range % sub, 0);
            prop_assert_eq!(step % sub, 0);
            if step > bound {
                prop_assert!(sub <= bound);
            }
        }
    }

    #[test]
    fn prop_merge_ignores_shard_order(
        op in operator(),
        samples in samples(),
        split in 1usize..39,
        rotate in 0usize..3,
    ) {
        // Two time-disjoint partials of the same bucket plus one repeat of the
        // later partial from a replica
        let split = split.min(samples.len() - 1);
        let (early, late) = samples.split_at(split);
        let mut shards = vec![
            vec![payload(op, early)],
            vec![payload(op, late)],
        ];
        if !matches!(op, Operator::OverTime(_) | Operator::Delta) {
            shards.push(vec![payload(op, late)]);
        }

        let ctx = context(op);
        let expected = merge_series(&shards, &ctx).unwrap();
        let shard_count = shards.len();
        shards.rotate_left(rotate % shard_count);
        let rotated = merge_series(&shards, &ctx).unwrap();
        shards.reverse();
        let reversed = merge_series(&shards, &ctx).unwrap();

        prop_assert_eq!(&expected, &rotated);
        prop_assert_eq!(&expected, &reversed);
    }

    #[test]
    fn prop_split_sum_matches_unsplit(samples in samples(), split in 1usize..39) {
        let op = Operator::OverTime(OverTimeFn::Sum);
        let split = split.min(samples.len() - 1);
        let (early, late) = samples.split_at(split);
        let ctx = context(op);

        let whole = merge_series(&[vec![payload(op, &samples)]], &ctx).unwrap();
        let parts = merge_series(&[vec![payload(op, early)], vec![payload(op, late)]], &ctx).unwrap();
        prop_assert_eq!(whole.len(), 1);
        prop_assert!((whole[0].v - parts[0].v).abs() < 1e-6);
    }
}
