//! Series-Identity Cache
//!
//! Resolves a selector to the fingerprints ("tsids") of the series it
//! matches, remembering the time range each resolution is valid for.
//!
//! For a window `[start, end]` and a cached entry the cache picks one of:
//!
//! | Situation | Action |
//! |---|---|
//! | no entry, stale entry, full-refresh interval elapsed, disjoint window | full rebuild |
//! | window inside `[StartTime, EndTime]` | pure read |
//! | head before `StartTime` | fetch the head only |
//! | tail after `EndTime`, `EndTime` close to now | extend `EndTime` without fetching |
//! | tail after `EndTime`, older | fetch the tail only |
//!
//! An entry is stale when it was refreshed before the last update of its
//! model. Requests with extra filters never read or write the cache;
//! previews read but never write. Updates are computed in full before they
//! are stored, so a failed fetch leaves the previous entry intact.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::backend::{tsid_after, Clock, RequestBuilder, RequestSpec, SearchClient};
use crate::bucket;
use crate::config::Config;
use crate::error::Result;
use crate::metrics;
use crate::models::ModelRegistry;
use crate::promql::VectorSelector;
use crate::types::{fingerprint, Labels, Query, Tsid, LABELS_STR_FIELD, TSID_FIELD};

/// Fingerprints known for one (model, selector) pair
#[derive(Debug, Clone, PartialEq)]
pub struct TsidData {
    /// Sorted, deduplicated fingerprints
    pub tsids: Vec<Tsid>,
    /// Labels per fingerprint
    pub tsids_map: HashMap<Tsid, Labels>,
    /// Start of the range the set is valid for (ms)
    pub start_time: i64,
    /// End of the range the set is valid for (ms)
    pub end_time: i64,
    /// Last incremental refresh (ms)
    pub refresh_time: i64,
    /// Last full rebuild (ms)
    pub full_refresh_time: i64,
}

impl TsidData {
    fn new(start_time: i64, end_time: i64, now: i64) -> Self {
        Self {
            tsids: Vec::new(),
            tsids_map: HashMap::new(),
            start_time,
            end_time,
            refresh_time: now,
            full_refresh_time: now,
        }
    }

    /// Whether `[start, end]` lies inside the valid range
    pub fn covers(&self, start: i64, end: i64) -> bool {
        start >= self.start_time && end <= self.end_time
    }

    /// Number of fingerprints
    pub fn len(&self) -> usize {
        self.tsids.len()
    }

    /// Whether no series is known
    pub fn is_empty(&self) -> bool {
        self.tsids.is_empty()
    }

    fn absorb(&mut self, found: Vec<(Tsid, Labels)>) {
        for (tsid, labels) in found {
            self.tsids_map.entry(tsid).or_insert(labels);
        }
        self.tsids = self.tsids_map.keys().cloned().collect();
        self.tsids.sort();
    }
}

/// How a resolution was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the cache as is
    Hit,
    /// Tail gap within tolerance closed without a fetch
    Extended,
    /// Uncovered head and/or tail fetched and merged
    Incremental,
    /// Rebuilt from scratch
    Full,
    /// Cache not consulted
    Bypass,
}

impl CacheOutcome {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Extended => "extend",
            CacheOutcome::Incremental => "incremental",
            CacheOutcome::Full => "full",
            CacheOutcome::Bypass => "bypass",
        }
    }
}

/// Result of [`TsidCache::resolve`]
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Fingerprints valid for the window
    pub data: Arc<TsidData>,
    /// How they were obtained
    pub outcome: CacheOutcome,
}

enum Plan {
    Hit,
    Extend,
    Incremental { head: Option<(i64, i64)>, tail: Option<(i64, i64)> },
    Full,
}

/// Process-wide series identity cache
pub struct TsidCache {
    builder: Arc<dyn RequestBuilder>,
    client: Arc<dyn SearchClient>,
    models: Arc<ModelRegistry>,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, Arc<TsidData>>,
    page_size: usize,
    max_series: usize,
    full_refresh_interval_ms: i64,
    tail_tolerance_ms: i64,
}

impl TsidCache {
    /// Create an empty cache
    pub fn new(
        builder: Arc<dyn RequestBuilder>,
        client: Arc<dyn SearchClient>,
        models: Arc<ModelRegistry>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            builder,
            client,
            models,
            clock,
            entries: DashMap::new(),
            page_size: config.query.tsid_page_size.max(1),
            max_series: config.query.max_series,
            full_refresh_interval_ms: config.cache.tsid_full_refresh_interval_ms(),
            tail_tolerance_ms: config.cache.tsid_tail_tolerance_ms,
        }
    }

    /// Cache key of a selector within a model
    pub fn cache_key(model_id: Option<&str>, selector: &VectorSelector) -> String {
        let serialized = serde_json::to_string(selector).unwrap_or_else(|_| format!("{:?}", selector));
        format!("{}:{}", model_id.unwrap_or(""), fingerprint(&serialized))
    }

    /// Cached entry, if any
    pub fn entry(&self, model_id: Option<&str>, selector: &VectorSelector) -> Option<Arc<TsidData>> {
        self.entries
            .get(&Self::cache_key(model_id, selector))
            .map(|e| Arc::clone(e.value()))
    }

    /// Fingerprints of the series `selector` matches within the query window
    ///
    /// `indices` are the fingerprint-indexed indices to list from and `must`
    /// any group-level filter clauses.
    pub async fn resolve(
        &self,
        selector: &VectorSelector,
        query: &Query,
        indices: &[String],
        must: &[Value],
    ) -> Result<Resolved> {
        let (start, end) = (query.start, query.end);
        let now = self.clock.now_ms();

        if !query.filters.is_empty() {
            let mut data = TsidData::new(start, end, now);
            data.absorb(self.fetch(selector, query, start, end, indices, must).await?);
            return Ok(self.finish(Arc::new(data), CacheOutcome::Bypass, selector));
        }

        let key = Self::cache_key(query.model_id.as_deref(), selector);
        let cached = self.entries.get(&key).map(|e| Arc::clone(e.value()));
        let plan = match &cached {
            Some(entry) => self.plan(entry, query, now),
            None => Plan::Full,
        };

        let (data, outcome) = match (plan, cached) {
            (Plan::Hit, Some(entry)) => return Ok(self.finish(entry, CacheOutcome::Hit, selector)),
            (Plan::Extend, Some(entry)) => {
                let mut data = (*entry).clone();
                data.end_time = end;
                (data, CacheOutcome::Extended)
            },
            (Plan::Incremental { head, tail }, Some(entry)) => {
                let mut data = (*entry).clone();
                if let Some((from, to)) = head {
                    data.absorb(self.fetch(selector, query, from, to, indices, must).await?);
                    data.start_time = from;
                }
                if let Some((from, to)) = tail {
                    data.absorb(self.fetch(selector, query, from, to, indices, must).await?);
                    data.end_time = to;
                }
                data.refresh_time = now;
                (data, CacheOutcome::Incremental)
            },
            _ => {
                let mut data = TsidData::new(start, end, now);
                data.absorb(self.fetch(selector, query, start, end, indices, must).await?);
                (data, CacheOutcome::Full)
            },
        };

        let data = Arc::new(data);
        if query.is_cacheable() {
            self.entries.insert(key, Arc::clone(&data));
        }
        Ok(self.finish(data, outcome, selector))
    }

    fn plan(&self, entry: &TsidData, query: &Query, now: i64) -> Plan {
        let stale = query
            .model_id
            .as_deref()
            .and_then(|m| self.models.last_update(m))
            .is_some_and(|updated| entry.refresh_time < updated);
        let expired = now - entry.full_refresh_time >= self.full_refresh_interval_ms;
        let disjoint = query.end < entry.start_time || query.start > entry.end_time;
        if stale || expired || disjoint {
            return Plan::Full;
        }

        if entry.covers(query.start, query.end) {
            return Plan::Hit;
        }

        let head = (query.start < entry.start_time).then_some((query.start, entry.start_time));
        let tail_gap = query.end > entry.end_time;
        let tail_recent = entry.end_time >= now - self.tail_tolerance_ms;

        match (head, tail_gap) {
            (None, true) if tail_recent => Plan::Extend,
            (head, true) if !tail_recent => Plan::Incremental {
                head,
                tail: Some((entry.end_time, query.end)),
            },
            (head, _) => {
                // A recent tail gap rides along with the head fetch
                let tail = (tail_gap && head.is_some()).then_some((entry.end_time, query.end));
                Plan::Incremental { head, tail }
            },
        }
    }

    fn finish(&self, data: Arc<TsidData>, outcome: CacheOutcome, selector: &VectorSelector) -> Resolved {
        metrics::record_tsid_cache(outcome.as_str());
        debug!(
            metric = %selector.metric,
            outcome = outcome.as_str(),
            series = data.len(),
            start = data.start_time,
            end = data.end_time,
            "Resolved series identities"
        );
        Resolved { data, outcome }
    }

    async fn fetch(
        &self,
        selector: &VectorSelector,
        query: &Query,
        start: i64,
        end: i64,
        indices: &[String],
        must: &[Value],
    ) -> Result<Vec<(Tsid, Labels)>> {
        let group_by = vec![TSID_FIELD.to_string(), LABELS_STR_FIELD.to_string()];
        let mut found = Vec::new();
        let mut offset: Option<Tsid> = None;

        loop {
            let mut clauses: Vec<Value> = must.to_vec();
            clauses.extend(query.filters.iter().cloned());
            if let Some(after) = &offset {
                clauses.push(tsid_after(after));
            }

            let request = self.builder.build(&RequestSpec {
                selector: selector.clone(),
                start,
                end,
                group_by: group_by.clone(),
                aggregation: None,
                interval: None,
                offset: 0,
                must: clauses,
                tsid_path: true,
                size: Some(self.page_size),
            })?;
            let body = self.client.execute(&request, indices, None, None).await?;
            let page = bucket::decode(&body, &group_by)?;
            if page.is_empty() {
                break;
            }

            offset = page.iter().filter_map(|s| s.tsid.clone()).max();
            for series in page {
                if let Some(tsid) = series.tsid {
                    found.push((tsid, series.labels));
                }
            }
            if found.len() >= self.max_series || offset.is_none() {
                break;
            }
        }

        found.truncate(self.max_series);
        debug!(start, end, series = found.len(), "Listed series fingerprints");
        Ok(found)
    }
}
