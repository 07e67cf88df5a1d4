//! In-memory collaborator implementations
//!
//! These implementations are intended for:
//! - **Unit testing** the query core without a search cluster
//! - **Integration testing** full evaluations against known samples
//! - **Prototyping** new operators
//!
//! [`MemoryStore`] plays every data-facing role at once: it builds requests,
//! executes them against its own samples, describes its shard layout and
//! resolves log groups. Requests it builds are plain JSON; the client side
//! interprets exactly the clauses the query core emits.
//!
//! # Warning
//!
//! Nothing here is meant for production: all data lives in memory and
//! every request scans every series.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::backend::{
    Clock, JobScheduler, LogGroup, LogGroupSource, RequestBuilder, RequestSpec, SearchClient,
    SearchRequest, ShardMetadataSource,
};
use crate::bucket::HISTOGRAM_AGG;
use crate::error::{Error, Result};
use crate::merge::{ChangesPoint, DeltaPoint, IratePoint, RatePoint, SamplePoint};
use crate::operator::{Operator, OverTimeFn};
use crate::promql::VectorSelector;
use crate::shards::{IndexShards, Routing};
use crate::types::{Labels, Tsid, LABELS_STR_FIELD, TSID_FIELD};

// =============================================================================
// Clock and scheduler
// =============================================================================

/// Clock moved by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock starting at `now_ms`
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    /// Jump to `now_ms`
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `ms`
    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Scheduler remembering every reschedule call
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    calls: Mutex<Vec<String>>,
}

impl RecordingScheduler {
    /// Models rescheduled so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl JobScheduler for RecordingScheduler {
    async fn reschedule(&self, model_id: &str) -> Result<()> {
        self.calls.lock().push(model_id.to_string());
        Ok(())
    }
}

// =============================================================================
// Shard metadata
// =============================================================================

/// Shard metadata served from fixed JSON payloads
#[derive(Debug, Default)]
pub struct MemoryShardSource {
    payloads: RwLock<HashMap<String, String>>,
    loads: AtomicUsize,
}

impl MemoryShardSource {
    /// Empty source; every pattern is unknown
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `payload` for `pattern`
    pub fn set(&self, pattern: &str, payload: &str) {
        self.payloads.write().insert(pattern.to_string(), payload.to_string());
    }

    /// Loads served so far
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShardMetadataSource for MemoryShardSource {
    async fn load_index_shards(&self, pattern: &str) -> Result<Bytes> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .read()
            .get(pattern)
            .map(|p| Bytes::from(p.clone()))
            .ok_or_else(|| Error::internal(format!("no indices match '{}'", pattern)))
    }
}

// =============================================================================
// Memory store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredSeries {
    metric: String,
    labels: Labels,
    labels_str: String,
    tsid: Tsid,
    samples: Vec<(i64, f64)>,
}

#[derive(Debug, Default)]
struct StoredIndex {
    shards: u32,
    routing: Routing,
    tsid_indexed: bool,
    series: BTreeMap<(String, String), StoredSeries>,
}

/// Request body produced by [`MemoryStore`] as a request builder
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreRequest {
    selector: VectorSelector,
    start: i64,
    end: i64,
    group_by: Vec<String>,
    aggregation: Option<Operator>,
    interval: Option<i64>,
    offset: i64,
    must: Vec<Value>,
    size: Option<usize>,
}

#[derive(Debug, Default)]
struct Faults {
    all: bool,
    shard: Option<u32>,
}

/// In-memory metric store implementing every data-facing collaborator
#[derive(Debug, Default)]
pub struct MemoryStore {
    indices: RwLock<BTreeMap<String, StoredIndex>>,
    log_groups: RwLock<HashMap<String, LogGroup>>,
    faults: RwLock<Faults>,
    requests: Mutex<Vec<Value>>,
    search_calls: AtomicUsize,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index
    pub fn add_index(&self, name: &str, shards: u32, routing: Routing, tsid_indexed: bool) {
        self.indices.write().insert(
            name.to_string(),
            StoredIndex {
                shards: shards.max(1),
                routing,
                tsid_indexed,
                series: BTreeMap::new(),
            },
        );
    }

    /// Append a sample; unknown indices are created with one shard
    pub fn push(&self, index: &str, metric: &str, labels: Labels, t: i64, v: f64) {
        let mut indices = self.indices.write();
        let stored = indices.entry(index.to_string()).or_insert_with(|| StoredIndex {
            shards: 1,
            ..StoredIndex::default()
        });
        let labels_str = labels.to_labels_str();
        let series = stored
            .series
            .entry((metric.to_string(), labels_str.clone()))
            .or_insert_with(|| StoredSeries {
                metric: metric.to_string(),
                tsid: labels.fingerprint(),
                labels,
                labels_str,
                samples: Vec::new(),
            });
        series.samples.push((t, v));
        series.samples.sort_by(|a, b| a.0.cmp(&b.0));
    }

    /// Register a log group
    pub fn add_log_group(&self, id: &str, index_patterns: &[&str], must_filter: Option<Value>) {
        self.log_groups.write().insert(
            id.to_string(),
            LogGroup {
                index_patterns: index_patterns.iter().map(|p| p.to_string()).collect(),
                must_filter,
            },
        );
    }

    /// Fail every search request
    pub fn fail_searches(&self, fail: bool) {
        self.faults.write().all = fail;
    }

    /// Fail search requests pinned to `shard`
    pub fn fail_shard(&self, shard: Option<u32>) {
        self.faults.write().shard = shard;
    }

    /// Search requests executed so far
    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Bodies of the executed search requests
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }

    /// Layout of one index
    pub fn index_shards(&self, name: &str) -> Vec<IndexShards> {
        self.indices
            .read()
            .get(name)
            .map(|i| {
                vec![IndexShards {
                    index: name.to_string(),
                    primary_shards: i.shards,
                    routing: i.routing,
                    tsid_indexed: i.tsid_indexed,
                }]
            })
            .unwrap_or_default()
    }

    fn shard_of(tsid: &str, shards: u32) -> u32 {
        (u64::from_str_radix(tsid, 16).unwrap_or(0) % u64::from(shards.max(1))) as u32
    }

    fn clause_matches(clause: &Value, series: &StoredSeries) -> Result<bool> {
        let unsupported = || Error::internal(format!("unsupported clause: {}", clause));
        let (kind, body) = clause
            .as_object()
            .and_then(|o| o.iter().next())
            .ok_or_else(unsupported)?;
        let (field, arg) = body
            .as_object()
            .and_then(|o| o.iter().next())
            .ok_or_else(unsupported)?;

        let actual = match field.as_str() {
            TSID_FIELD => series.tsid.as_str(),
            LABELS_STR_FIELD => series.labels_str.as_str(),
            name => series.labels.get(name).unwrap_or(""),
        };

        match kind.as_str() {
            "term" => Ok(arg.as_str() == Some(actual)),
            "terms" => Ok(arg
                .as_array()
                .ok_or_else(unsupported)?
                .iter()
                .any(|v| v.as_str() == Some(actual))),
            "range" => {
                let gt = arg.get("gt").and_then(Value::as_str).ok_or_else(unsupported)?;
                Ok(actual > gt)
            },
            _ => Err(unsupported()),
        }
    }

    fn group_value(series: &StoredSeries, field: &str) -> String {
        match field {
            TSID_FIELD => series.tsid.clone(),
            LABELS_STR_FIELD => series.labels_str.clone(),
            name => series.labels.get(name).unwrap_or("").to_string(),
        }
    }

    fn histogram(request: &StoreRequest, op: Operator, samples: &[(i64, f64)]) -> Result<Value> {
        let interval = request
            .interval
            .filter(|i| *i > 0)
            .ok_or_else(|| Error::exec("histogram interval missing"))?;
        let mut slices: BTreeMap<i64, Vec<(i64, f64)>> = BTreeMap::new();
        for &(t, v) in samples {
            let key = request.offset + (t - request.offset).div_euclid(interval) * interval;
            slices.entry(key).or_default().push((t, v));
        }

        let mut buckets = Vec::with_capacity(slices.len());
        for (key, slice) in slices {
            buckets.push(json!({
                "key": key,
                "doc_count": slice.len(),
                "value": bucket_payload(op, &slice)?,
            }));
        }
        Ok(json!({ "buckets": buckets }))
    }

    fn nest(request: &StoreRequest, level: usize, series: &[&StoredSeries]) -> Result<Value> {
        let field = &request.group_by[level];
        let mut groups: BTreeMap<String, Vec<&StoredSeries>> = BTreeMap::new();
        for s in series {
            groups.entry(Self::group_value(s, field)).or_default().push(*s);
        }

        let mut buckets = Vec::with_capacity(groups.len());
        let limit = if level == 0 { request.size } else { None };
        for (key, members) in groups.into_iter().take(limit.unwrap_or(usize::MAX)) {
            let mut bucket = Map::new();
            bucket.insert("key".to_string(), Value::String(key));
            let docs: usize = members.iter().map(|s| s.samples.len()).sum();
            bucket.insert("doc_count".to_string(), json!(docs));

            if level + 1 < request.group_by.len() {
                bucket.insert(request.group_by[level + 1].clone(), Self::nest(request, level + 1, &members)?);
            } else if let Some(op) = request.aggregation {
                let mut samples: Vec<(i64, f64)> = members.iter().flat_map(|s| s.samples.iter().copied()).collect();
                samples.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)));
                bucket.insert(HISTOGRAM_AGG.to_string(), Self::histogram(request, op, &samples)?);
            }
            buckets.push(Value::Object(bucket));
        }
        Ok(json!({ "buckets": buckets }))
    }
}

fn bucket_payload(op: Operator, slice: &[(i64, f64)]) -> Result<Value> {
    let (first, last) = match (slice.first(), slice.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return Ok(Value::Null),
    };
    let count = slice.len() as u64;

    let value = match op {
        Operator::Sampling => serde_json::to_value(SamplePoint { t: last.0, v: last.1 })?,
        Operator::OverTime(OverTimeFn::Sum) | Operator::OverTime(OverTimeFn::Avg) => {
            json!(slice.iter().map(|s| s.1).sum::<f64>())
        },
        Operator::OverTime(OverTimeFn::Max) => json!(slice.iter().map(|s| s.1).fold(f64::NEG_INFINITY, f64::max)),
        Operator::OverTime(OverTimeFn::Min) => json!(slice.iter().map(|s| s.1).fold(f64::INFINITY, f64::min)),
        Operator::OverTime(OverTimeFn::Count) => json!(count),
        Operator::Rate(_) => {
            let correction = slice
                .windows(2)
                .filter(|w| w[1].1 < w[0].1)
                .map(|w| w[0].1)
                .sum();
            serde_json::to_value(RatePoint {
                first_t: first.0,
                first_v: first.1,
                last_t: last.0,
                last_v: last.1,
                correction,
                count,
            })?
        },
        Operator::Irate => {
            let previous = slice.iter().rev().find(|s| s.0 < last.0).copied();
            serde_json::to_value(IratePoint {
                previous_t: previous.map(|p| p.0),
                previous_v: previous.map(|p| p.1),
                last_t: last.0,
                last_v: last.1,
            })?
        },
        Operator::Changes => serde_json::to_value(ChangesPoint {
            first_t: first.0,
            first_v: first.1,
            last_t: last.0,
            last_v: last.1,
            changes: slice.windows(2).filter(|w| w[0].1 != w[1].1).count() as u64,
        })?,
        Operator::Delta => serde_json::to_value(DeltaPoint {
            first_t: first.0,
            first_v: first.1,
            last_t: last.0,
            last_v: last.1,
            count,
        })?,
    };
    Ok(value)
}

impl RequestBuilder for MemoryStore {
    fn build(&self, spec: &RequestSpec) -> Result<SearchRequest> {
        if spec.selector.metric.is_empty() {
            return Err(Error::exec("metric name is required"));
        }
        if spec.aggregation.is_some() && spec.interval.is_none() {
            return Err(Error::exec("histogram interval missing"));
        }
        let body = serde_json::to_value(StoreRequest {
            selector: spec.selector.clone(),
            start: spec.start,
            end: spec.end,
            group_by: spec.group_by.clone(),
            aggregation: spec.aggregation,
            interval: spec.interval,
            offset: spec.offset,
            must: spec.must.clone(),
            size: spec.size,
        })?;
        Ok(SearchRequest { body })
    }
}

#[async_trait]
impl SearchClient for MemoryStore {
    async fn execute(
        &self,
        request: &SearchRequest,
        indices: &[String],
        shard: Option<u32>,
        _preference: Option<&str>,
    ) -> Result<Bytes> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.body.clone());
        {
            let faults = self.faults.read();
            if faults.all || (shard.is_some() && faults.shard == shard) {
                return Err(Error::internal(format!("search failed on shard {:?}", shard)));
            }
        }

        let request: StoreRequest = serde_json::from_value(request.body.clone())?;
        if request.group_by.is_empty() {
            return Ok(Bytes::from(json!({ "aggregations": {} }).to_string()));
        }
        let needs_tsid = request.group_by.iter().any(|f| f == TSID_FIELD)
            || request.must.iter().any(|c| c.to_string().contains(TSID_FIELD));

        let store = self.indices.read();
        let mut selected: Vec<StoredSeries> = Vec::new();
        for name in indices {
            let Some(index) = store.get(name) else { continue };
            if needs_tsid && !index.tsid_indexed {
                continue;
            }
            for series in index.series.values() {
                if series.metric != request.selector.metric
                    || shard.is_some_and(|s| Self::shard_of(&series.tsid, index.shards) != s)
                    || !request.selector.matches(&series.labels)?
                {
                    continue;
                }
                let mut keep = true;
                for clause in &request.must {
                    if !Self::clause_matches(clause, series)? {
                        keep = false;
                        break;
                    }
                }
                if !keep {
                    continue;
                }

                let samples: Vec<(i64, f64)> = series
                    .samples
                    .iter()
                    .copied()
                    .filter(|(t, _)| *t >= request.start && *t < request.end)
                    .collect();
                if !samples.is_empty() {
                    selected.push(StoredSeries { samples, ..series.clone() });
                }
            }
        }
        drop(store);

        let refs: Vec<&StoredSeries> = selected.iter().collect();
        let root = Self::nest(&request, 0, &refs)?;
        let mut aggregations = Map::new();
        aggregations.insert(request.group_by[0].clone(), root);
        Ok(Bytes::from(json!({ "aggregations": aggregations }).to_string()))
    }
}

#[async_trait]
impl ShardMetadataSource for MemoryStore {
    async fn load_index_shards(&self, pattern: &str) -> Result<Bytes> {
        let matches = |name: &str| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        };
        let listing: Vec<Value> = self
            .indices
            .read()
            .iter()
            .filter(|(name, _)| matches(name))
            .map(|(name, index)| {
                json!({
                    "index": name,
                    "pri": index.shards.to_string(),
                    "routing": index.routing,
                    "tsid_indexed": index.tsid_indexed,
                })
            })
            .collect();
        Ok(Bytes::from(Value::Array(listing).to_string()))
    }
}

#[async_trait]
impl LogGroupSource for MemoryStore {
    async fn resolve(&self, group_id: &str) -> Result<LogGroup> {
        self.log_groups
            .read()
            .get(group_id)
            .cloned()
            .ok_or_else(|| Error::bad_data(format!("unknown log group '{}'", group_id)))
    }
}
