//! Query evaluation and result assembly
//!
//! `Evaluator::evaluate` drives one expression through the core:
//!
//! ```text
//! normalize window ─► resolve log group ─► shard layout per pattern
//!        │
//!        ▼
//! candidate series: fingerprint cache (tsid indices) ∪ label listing (legacy indices, paged only)
//!        │
//!        ▼
//! optional page slice ─► value fetch per (path, routing) ─► merge engine ─► Matrix | PageMatrix
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::backend::{
    labels_str_terms, Clock, JobScheduler, LogGroupSource, RequestBuilder, RequestSpec,
    SearchClient, ShardMetadataSource,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::merge::{self, FillPolicy, MergeContext, MergeWindow};
use crate::metrics;
use crate::models::ModelRegistry;
use crate::operator::Operator;
use crate::pool::Pools;
use crate::promql::{Expr, VectorSelector};
use crate::scatter::{batch_size, MapResult, ScatterGather};
use crate::services::Service;
use crate::shards::{IndexShards, Routing, ShardMetadataCache};
use crate::tsid::TsidCache;
use crate::types::{
    Labels, PageMatrix, Point, Query, QueryOutput, Series, Tsid, LABELS_STR_FIELD,
    METRIC_NAME_LABEL, TSID_FIELD,
};
use crate::window::{normalize, NormalizedWindow};

/// External collaborators of the evaluator
#[derive(Clone)]
pub struct Collaborators {
    /// Search request builder
    pub builder: Arc<dyn RequestBuilder>,
    /// Search request executor
    pub client: Arc<dyn SearchClient>,
    /// Index shard layouts
    pub shard_source: Arc<dyn ShardMetadataSource>,
    /// Log group metadata
    pub log_groups: Arc<dyn LogGroupSource>,
    /// Downstream job scheduler
    pub scheduler: Option<Arc<dyn JobScheduler>>,
    /// Wall clock
    pub clock: Arc<dyn Clock>,
}

/// Entry point of the query core
pub struct Evaluator {
    config: Config,
    pools: Pools,
    log_groups: Arc<dyn LogGroupSource>,
    shards: Arc<ShardMetadataCache>,
    models: Arc<ModelRegistry>,
    tsids: Arc<TsidCache>,
    scatter: ScatterGather,
}

/// Candidate series of one evaluation
#[derive(Default)]
struct Candidates {
    tsids: Vec<Tsid>,
    labels: HashMap<String, Labels>,
}

impl Evaluator {
    /// Wire the core on top of `collaborators`
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let pools = Pools::new(&config.pools);

        let mut models = ModelRegistry::new(Arc::clone(&collaborators.clock), pools.detached.clone());
        if let Some(scheduler) = collaborators.scheduler.clone() {
            models = models.with_scheduler(scheduler);
        }
        let models = Arc::new(models);

        let shards = Arc::new(ShardMetadataCache::new(
            Arc::clone(&collaborators.shard_source),
            config.cache.shard_refresh_interval(),
        ));
        let tsids = Arc::new(TsidCache::new(
            Arc::clone(&collaborators.builder),
            Arc::clone(&collaborators.client),
            Arc::clone(&models),
            Arc::clone(&collaborators.clock),
            &config,
        ));
        let scatter = ScatterGather::new(
            collaborators.builder,
            collaborators.client,
            pools.clone(),
            config.query.cancel_on_error,
        );

        Self {
            config,
            pools,
            log_groups: collaborators.log_groups,
            shards,
            models,
            tsids,
            scatter,
        }
    }

    /// Model update registry
    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    /// Shard metadata cache
    pub fn shard_cache(&self) -> &Arc<ShardMetadataCache> {
        &self.shards
    }

    /// Series identity cache
    pub fn tsid_cache(&self) -> &Arc<TsidCache> {
        &self.tsids
    }

    /// Worker pools
    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// Background services to register with a service manager
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        vec![Arc::clone(&self.shards) as Arc<dyn Service>]
    }

    /// Evaluate `expr` over `query` with operator `op`
    ///
    /// An automatic range in `expr` is replaced by the resolved one.
    /// Returns every series when the query asks for all series, otherwise one
    /// page plus the total candidate count.
    pub async fn evaluate(&self, expr: &mut Expr, query: &Query, op: Operator) -> Result<QueryOutput> {
        let started = Instant::now();
        let result = self.evaluate_inner(expr, query, op).await;
        metrics::record_query(op.name(), started.elapsed().as_secs_f64(), result.is_ok());
        if let Err(e) = &result {
            debug!(op = %op, error = %e, kind = %e.kind(), "Evaluation failed");
        }
        result
    }

    async fn evaluate_inner(&self, expr: &mut Expr, query: &Query, op: Operator) -> Result<QueryOutput> {
        let window = normalize(query, expr)?;
        let selector = expr.selector()?.0.clone();
        let q = &window.query;

        let group_id = q
            .log_group
            .as_deref()
            .filter(|g| !g.is_empty())
            .ok_or_else(|| Error::bad_data("log group id is required"))?;
        let group = self.log_groups.resolve(group_id).await?;
        let group_must: Vec<Value> = group.must_filter.into_iter().collect();

        let indices = self.indices(&group.index_patterns).await?;
        let (tsid_indices, label_indices): (Vec<IndexShards>, Vec<IndexShards>) =
            indices.into_iter().partition(|i| i.tsid_indexed);

        let mut candidates = Candidates::default();
        if !tsid_indices.is_empty() {
            let names: Vec<String> = tsid_indices.iter().map(|i| i.index.clone()).collect();
            let resolved = self.tsids.resolve(&selector, q, &names, &group_must).await?;
            candidates.tsids = resolved.data.tsids.clone();
            candidates.labels = resolved.data.tsids_map.clone();
        }

        let mut must = group_must;
        must.extend(q.filters.iter().cloned());

        let paged = q.limit.is_some();
        let mut page_total = None;
        let mut label_filter: Option<Vec<String>> = None;

        if let Some(limit) = q.limit {
            if !label_indices.is_empty() {
                let listing = self.list_labels(&selector, q, &label_indices, &must).await?;
                for (key, labels) in listing.labels_map {
                    candidates.labels.entry(key).or_insert(labels);
                }
            }

            let all: BTreeSet<&String> = candidates.labels.keys().collect();
            page_total = Some(all.len());
            let page: Vec<String> = all.into_iter().skip(q.offset).take(limit).cloned().collect();
            let in_page: HashSet<&String> = page.iter().collect();

            candidates.tsids.retain(|t| in_page.contains(t));
            label_filter = Some(
                page.iter()
                    .filter_map(|k| candidates.labels.get(k).map(Labels::to_labels_str))
                    .collect(),
            );
            debug!(offset = q.offset, limit, total = page_total.unwrap_or(0), page = page.len(), "Sliced series page");
        }

        let mut gathered = MapResult::default();
        for routing in [Routing::ThirtyMinutes, Routing::TwoHours] {
            let tsid_group: Vec<IndexShards> = tsid_indices.iter().filter(|i| i.routing == routing).cloned().collect();
            if !tsid_group.is_empty() && !candidates.tsids.is_empty() {
                let spec = self.value_spec(&selector, &window, op, routing, true, &must);
                let buckets = ((q.end - q.start) / spec.interval.unwrap_or(1).max(1)).max(1) as usize;
                let size = batch_size(self.config.query.max_points_per_query, buckets);
                gathered.merge(self.scatter.execute_tsids(&spec, &tsid_group, &candidates.tsids, size).await?);
            }

            let label_group: Vec<IndexShards> = label_indices.iter().filter(|i| i.routing == routing).cloned().collect();
            if label_group.is_empty() || label_filter.as_ref().is_some_and(|f| f.is_empty()) {
                continue;
            }
            let mut spec = self.value_spec(&selector, &window, op, routing, false, &must);
            if let Some(filter) = &label_filter {
                spec.must.push(labels_str_terms(filter));
            }
            gathered.merge(self.scatter.execute(&spec, &label_group).await?);
        }

        for (key, labels) in candidates.labels {
            if gathered.ts_value_map.contains_key(&key) {
                let entry = gathered.labels_map.entry(key).or_default();
                if entry.is_empty() {
                    *entry = labels;
                }
            }
        }
        let total_series = page_total.unwrap_or_else(|| gathered.len());

        let ctx = MergeContext {
            op,
            window: MergeWindow::from_query(q, window.range),
            fill: FillPolicy::for_query(q, &self.config.query),
        };
        let (labels_map, series) = gathered.into_series();
        let merged = merge::merge_all(series, ctx, &self.pools.merge, self.config.query.cancel_on_error).await?;
        let matrix = assemble(merged, labels_map, &selector, op);

        debug!(
            op = %op,
            metric = %selector.metric,
            series = matrix.len(),
            total_series,
            paged,
            "Evaluated expression"
        );

        Ok(if q.need_all_series {
            QueryOutput::Matrix(matrix)
        } else {
            QueryOutput::Page(PageMatrix { matrix, total_series })
        })
    }

    async fn indices(&self, patterns: &[String]) -> Result<Vec<IndexShards>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for pattern in patterns {
            for index in self.shards.get(pattern).await?.iter() {
                if seen.insert(index.index.clone()) {
                    out.push(index.clone());
                }
            }
        }
        Ok(out)
    }

    async fn list_labels(
        &self,
        selector: &VectorSelector,
        q: &Query,
        indices: &[IndexShards],
        must: &[Value],
    ) -> Result<MapResult> {
        let spec = RequestSpec {
            selector: selector.clone(),
            start: q.start,
            end: q.end,
            group_by: vec![LABELS_STR_FIELD.to_string()],
            aggregation: None,
            interval: None,
            offset: 0,
            must: must.to_vec(),
            tsid_path: false,
            size: Some(self.config.query.max_series),
        };
        self.scatter.execute(&spec, indices).await
    }

    fn value_spec(
        &self,
        selector: &VectorSelector,
        window: &NormalizedWindow,
        op: Operator,
        routing: Routing,
        tsid_path: bool,
        must: &[Value],
    ) -> RequestSpec {
        let q = &window.query;
        let interval = routing.sub_interval(q);
        let group_by = if tsid_path {
            vec![TSID_FIELD.to_string(), LABELS_STR_FIELD.to_string()]
        } else {
            vec![LABELS_STR_FIELD.to_string()]
        };
        RequestSpec {
            selector: selector.clone(),
            start: q.start,
            end: q.end,
            group_by,
            aggregation: Some(op),
            interval: Some(interval),
            offset: window.bucket_offset(interval),
            must: must.to_vec(),
            tsid_path,
            size: None,
        }
    }
}

/// Attach labels to merged points in series key order
fn assemble(
    merged: Vec<(String, Vec<Point>)>,
    mut labels_map: HashMap<String, Labels>,
    selector: &VectorSelector,
    op: Operator,
) -> Vec<Series> {
    merged
        .into_iter()
        .map(|(key, points)| {
            let mut metric = labels_map.remove(&key).unwrap_or_default();
            if op.keeps_metric_name() {
                metric.insert(METRIC_NAME_LABEL, selector.metric.clone());
            } else {
                metric.remove(METRIC_NAME_LABEL);
            }
            Series { metric, points }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::OverTimeFn;

    fn labels_map() -> HashMap<String, Labels> {
        let mut map = HashMap::new();
        map.insert(
            "k".to_string(),
            Labels::from_pairs([("host", "a"), (METRIC_NAME_LABEL, "stale")]),
        );
        map
    }

    #[test]
    fn test_assemble_sets_metric_name_for_sampling_only() {
        let selector = VectorSelector::new("up");
        let merged = vec![("k".to_string(), vec![Point::new(1, 2.0)])];

        let sampled = assemble(merged.clone(), labels_map(), &selector, Operator::Sampling);
        assert_eq!(sampled[0].metric.get(METRIC_NAME_LABEL), Some("up"));
        assert_eq!(sampled[0].metric.get("host"), Some("a"));

        let summed = assemble(merged, labels_map(), &selector, Operator::OverTime(OverTimeFn::Sum));
        assert_eq!(summed[0].metric.get(METRIC_NAME_LABEL), None);
        assert_eq!(summed[0].points, vec![Point::new(1, 2.0)]);
    }

    #[test]
    fn test_assemble_tolerates_missing_labels() {
        let selector = VectorSelector::new("up");
        let merged = vec![("missing".to_string(), vec![Point::new(1, 2.0)])];
        let series = assemble(merged, HashMap::new(), &selector, Operator::Irate);
        assert!(series[0].metric.is_empty());
    }
}
