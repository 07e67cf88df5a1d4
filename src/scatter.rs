//! Scatter/Gather Executor
//!
//! One request per physical shard, pinned through a shard preference, run on
//! the shard pool. Responses are decoded into series and gathered into a
//! [`MapResult`]. Large fingerprint sets are split into batches that fit the
//! per-request bucket budget; batches run on the batch pool and their
//! partial results are merged.
//!
//! Series keys from both indexing paths live in the same fingerprint space:
//! `__tsid` keys are fingerprints, `__labels_str` keys are rehashed into
//! fingerprints by the decoder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::backend::{shard_preference, tsid_terms, RequestBuilder, RequestSpec, SearchClient};
use crate::bucket::{self, DecodedSeries, RawBucket};
use crate::error::Result;
use crate::metrics;
use crate::pool::Pools;
use crate::shards::IndexShards;
use crate::types::{Labels, Tsid};

/// Gathered per-shard results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapResult {
    /// Labels per series key
    pub labels_map: HashMap<String, Labels>,
    /// Per-shard bucket lists per series key
    pub ts_value_map: HashMap<String, Vec<Vec<RawBucket>>>,
    /// Series count after any pagination trim
    pub total_series: usize,
}

impl MapResult {
    /// Add decoded series from one shard response
    pub fn absorb(&mut self, decoded: Vec<DecodedSeries>) {
        for series in decoded {
            let labels = self.labels_map.entry(series.key.clone()).or_default();
            if labels.is_empty() {
                *labels = series.labels;
            }
            self.ts_value_map
                .entry(series.key)
                .or_default()
                .push(series.buckets);
        }
        self.total_series = self.labels_map.len();
    }

    /// Union labels and concatenate bucket lists of another result
    pub fn merge(&mut self, other: MapResult) {
        for (key, labels) in other.labels_map {
            let entry = self.labels_map.entry(key).or_default();
            if entry.is_empty() {
                *entry = labels;
            }
        }
        for (key, lists) in other.ts_value_map {
            self.ts_value_map.entry(key).or_default().extend(lists);
        }
        self.total_series = self.labels_map.len();
    }

    /// Number of series
    pub fn len(&self) -> usize {
        self.labels_map.len()
    }

    /// Whether no series was found
    pub fn is_empty(&self) -> bool {
        self.labels_map.is_empty()
    }

    /// Series keys in ascending order
    pub fn sorted_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.labels_map.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Split into `(key, bucket lists)` pairs in ascending key order
    pub fn into_series(mut self) -> (HashMap<String, Labels>, Vec<(String, Vec<Vec<RawBucket>>)>) {
        let mut series: Vec<(String, Vec<Vec<RawBucket>>)> = self.ts_value_map.drain().collect();
        series.sort_by(|a, b| a.0.cmp(&b.0));
        (self.labels_map, series)
    }
}

/// Fingerprints per request that keep `buckets_per_series` within `max_points`
pub fn batch_size(max_points: usize, buckets_per_series: usize) -> usize {
    (max_points / buckets_per_series.max(1)).max(1)
}

/// Fans requests out over shards
#[derive(Clone)]
pub struct ScatterGather {
    builder: Arc<dyn RequestBuilder>,
    client: Arc<dyn SearchClient>,
    pools: Pools,
    cancel_on_error: bool,
}

impl ScatterGather {
    /// Create an executor on `pools`
    pub fn new(
        builder: Arc<dyn RequestBuilder>,
        client: Arc<dyn SearchClient>,
        pools: Pools,
        cancel_on_error: bool,
    ) -> Self {
        Self {
            builder,
            client,
            pools,
            cancel_on_error,
        }
    }

    /// Run `spec` against every primary shard of `indices`
    pub async fn execute(&self, spec: &RequestSpec, indices: &[IndexShards]) -> Result<MapResult> {
        let request = Arc::new(self.builder.build(spec)?);
        let group_by = Arc::new(spec.group_by.clone());

        let mut group = self.pools.shard.group(self.cancel_on_error);
        for index in indices {
            for shard in 0..index.primary_shards {
                let client = Arc::clone(&self.client);
                let request = Arc::clone(&request);
                let group_by = Arc::clone(&group_by);
                let target = vec![index.index.clone()];
                group
                    .spawn(async move {
                        let started = Instant::now();
                        let preference = shard_preference(shard);
                        let result = match client.execute(&request, &target, Some(shard), Some(preference.as_str())).await {
                            Ok(body) => bucket::decode(&body, &group_by),
                            Err(e) => Err(e),
                        };
                        metrics::record_shard_task(started.elapsed().as_secs_f64(), result.is_ok());
                        if let Err(e) = &result {
                            warn!(index = %target[0], shard, error = %e, "Shard request failed");
                        }
                        result
                    })
                    .await?;
            }
        }

        let tasks = group.len();
        let responses = group.join().await?;
        let mut gathered = MapResult::default();
        for decoded in responses {
            gathered.absorb(decoded);
        }

        debug!(
            indices = indices.len(),
            tasks,
            series = gathered.len(),
            "Gathered shard responses"
        );
        Ok(gathered)
    }

    /// Run `spec` restricted to `tsids`, batching when they exceed `batch_size`
    pub async fn execute_tsids(
        &self,
        spec: &RequestSpec,
        indices: &[IndexShards],
        tsids: &[Tsid],
        batch_size: usize,
    ) -> Result<MapResult> {
        if tsids.is_empty() {
            return Ok(MapResult::default());
        }

        if tsids.len() <= batch_size {
            let mut direct = spec.clone();
            direct.must.push(tsid_terms(tsids));
            return self.execute(&direct, indices).await;
        }

        let batches = tsids.len().div_ceil(batch_size);
        debug!(series = tsids.len(), batch_size, batches, "Batching fingerprint query");

        let indices = Arc::new(indices.to_vec());
        let mut group = self.pools.batch.group(self.cancel_on_error);
        for chunk in tsids.chunks(batch_size) {
            let this = self.clone();
            let indices = Arc::clone(&indices);
            let mut batch = spec.clone();
            batch.must.push(tsid_terms(chunk));
            group
                .spawn(async move { this.execute(&batch, &indices).await })
                .await?;
        }

        let mut merged = MapResult::default();
        for partial in group.join().await? {
            merged.merge(partial);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{OverTimeFn, Operator};
    use crate::promql::VectorSelector;
    use crate::shards::Routing;
    use crate::stubs::MemoryStore;
    use crate::types::{LABELS_STR_FIELD, MINUTE_MS, TSID_FIELD};

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.add_index("m-1", 3, Routing::ThirtyMinutes, true);
        for (i, host) in ["a", "b", "c", "d"].iter().enumerate() {
            let labels = Labels::from_pairs([("host", *host)]);
            store.push("m-1", "up", labels.clone(), i as i64 * 1_000, 1.0);
            store.push("m-1", "up", labels, MINUTE_MS + i as i64 * 1_000, 2.0);
        }
        store
    }

    fn spec() -> RequestSpec {
        RequestSpec {
            selector: VectorSelector::new("up"),
            start: 0,
            end: 2 * MINUTE_MS,
            group_by: vec![TSID_FIELD.to_string(), LABELS_STR_FIELD.to_string()],
            aggregation: Some(Operator::OverTime(OverTimeFn::Sum)),
            interval: Some(MINUTE_MS),
            offset: 0,
            must: Vec::new(),
            tsid_path: true,
            size: None,
        }
    }

    fn executor(store: &Arc<MemoryStore>) -> ScatterGather {
        ScatterGather::new(store.clone(), store.clone(), Pools::default(), false)
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(batch_size(1_000, 10), 100);
        assert_eq!(batch_size(5, 10), 1);
        assert_eq!(batch_size(10, 0), 10);
    }

    #[tokio::test]
    async fn test_one_task_per_shard() {
        let store = store();
        let indices = store.index_shards("m-1");
        let result = executor(&store).execute(&spec(), &indices).await.unwrap();

        assert_eq!(store.search_calls(), 3);
        assert_eq!(result.len(), 4);
        for key in result.sorted_keys() {
            assert!(result.ts_value_map.contains_key(&key));
            let buckets: usize = result.ts_value_map[&key].iter().map(|l| l.len()).sum();
            assert_eq!(buckets, 2);
        }
    }

    #[tokio::test]
    async fn test_batched_equals_direct() {
        let store = store();
        let indices = store.index_shards("m-1");
        let tsids: Vec<Tsid> = {
            let mut t: Vec<Tsid> = ["a", "b", "c", "d"]
                .iter()
                .map(|h| Labels::from_pairs([("host", *h)]).fingerprint())
                .collect();
            t.sort();
            t
        };

        let direct = executor(&store).execute_tsids(&spec(), &indices, &tsids, 10).await.unwrap();
        let batched = executor(&store).execute_tsids(&spec(), &indices, &tsids, 1).await.unwrap();
        assert_eq!(direct.labels_map, batched.labels_map);
        assert_eq!(direct.len(), 4);

        let partial = executor(&store).execute_tsids(&spec(), &indices, &tsids[..2], 1).await.unwrap();
        assert_eq!(partial.len(), 2);
    }

    #[tokio::test]
    async fn test_shard_failure_fails_request() {
        let store = store();
        store.fail_shard(Some(1));
        let err = executor(&store).execute(&spec(), &store.index_shards("m-1")).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        // Every sibling still ran
        assert_eq!(store.search_calls(), 3);
    }

    #[test]
    fn test_map_result_merge_unions_and_concatenates() {
        let mut a = MapResult::default();
        a.absorb(vec![DecodedSeries {
            key: "k".into(),
            tsid: None,
            labels: Labels::from_pairs([("host", "a")]),
            buckets: vec![RawBucket { key: 0, doc_count: 1, value: serde_json::json!(1.0) }],
        }]);
        let mut b = a.clone();
        b.absorb(vec![DecodedSeries {
            key: "j".into(),
            tsid: None,
            labels: Labels::new(),
            buckets: Vec::new(),
        }]);
        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.ts_value_map["k"].len(), 2);
        assert_eq!(a.total_series, 2);
    }
}
