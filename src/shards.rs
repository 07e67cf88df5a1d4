//! Shard Metadata Cache
//!
//! Maps an index pattern to the indices it resolves to, with their primary
//! shard count, routing granularity, and whether they carry the `__tsid`
//! field. Entries load on first use and are reloaded on a fixed timer by
//! the cache's own service loop. A failed reload keeps the previous entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::ShardMetadataSource;
use crate::error::{Error, Result};
use crate::metrics;
use crate::services::{tick_or_shutdown, Service, ServiceStatus};
use crate::types::Query;

/// Routing granularity of an index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Routing {
    /// Data routed in 30 minute slices
    #[default]
    #[serde(rename = "30m")]
    ThirtyMinutes,
    /// Data routed in 2 hour slices
    #[serde(rename = "2h")]
    TwoHours,
}

impl Routing {
    /// Histogram width used against indices with this routing
    pub fn sub_interval(&self, query: &Query) -> i64 {
        match self {
            Routing::ThirtyMinutes => query.sub_interval_30m,
            Routing::TwoHours => query.sub_interval_2h,
        }
    }
}

/// Layout of one physical index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexShards {
    /// Index name
    pub index: String,
    /// Primary shard count
    pub primary_shards: u32,
    /// Routing granularity
    pub routing: Routing,
    /// Whether documents carry `__tsid`
    pub tsid_indexed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShardCount {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawIndexShards {
    index: String,
    pri: ShardCount,
    #[serde(default)]
    routing: Routing,
    #[serde(default)]
    tsid_indexed: bool,
}

/// Parse a shard metadata payload
pub fn parse_index_shards(bytes: &[u8]) -> Result<Vec<IndexShards>> {
    let raw: Vec<RawIndexShards> = serde_json::from_slice(bytes)
        .map_err(|e| Error::internal(format!("invalid shard metadata: {}", e)))?;

    raw.into_iter()
        .map(|r| {
            let primary_shards = match r.pri {
                ShardCount::Number(n) => u32::try_from(n).ok(),
                ShardCount::Text(s) => s.trim().parse::<u32>().ok(),
            }
            .ok_or_else(|| {
                Error::internal(format!("invalid primary shard count for index '{}'", r.index))
            })?;
            Ok(IndexShards {
                index: r.index,
                primary_shards,
                routing: r.routing,
                tsid_indexed: r.tsid_indexed,
            })
        })
        .collect()
}

/// Process-wide shard metadata cache
pub struct ShardMetadataCache {
    source: Arc<dyn ShardMetadataSource>,
    entries: DashMap<String, Arc<Vec<IndexShards>>>,
    refresh_interval: Duration,
    status: RwLock<ServiceStatus>,
}

impl ShardMetadataCache {
    /// Create an empty cache reloading every `refresh_interval`
    pub fn new(source: Arc<dyn ShardMetadataSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            entries: DashMap::new(),
            refresh_interval,
            status: RwLock::new(ServiceStatus::Starting),
        }
    }

    /// Indices of `pattern`, loading them on a miss
    pub async fn get(&self, pattern: &str) -> Result<Arc<Vec<IndexShards>>> {
        if let Some(entry) = self.entries.get(pattern) {
            return Ok(Arc::clone(entry.value()));
        }
        self.load(pattern).await
    }

    /// Load `pattern` from the source and replace its entry
    pub async fn load(&self, pattern: &str) -> Result<Arc<Vec<IndexShards>>> {
        let started = Instant::now();
        let loaded = match self.source.load_index_shards(pattern).await {
            Ok(bytes) => parse_index_shards(&bytes),
            Err(e) => Err(e),
        };
        metrics::record_shard_refresh(loaded.is_ok());

        let indices = Arc::new(loaded?);
        debug!(
            pattern,
            indices = indices.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Loaded shard metadata"
        );
        self.entries.insert(pattern.to_string(), Arc::clone(&indices));
        Ok(indices)
    }

    /// Reload every cached pattern; returns how many reloads succeeded
    pub async fn refresh_all(&self) -> usize {
        let patterns: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut refreshed = 0;
        for pattern in patterns {
            match self.load(&pattern).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(pattern = %pattern, error = %e, "Shard metadata refresh failed, keeping previous entry"),
            }
        }
        refreshed
    }

    /// Patterns currently cached
    pub fn patterns(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait::async_trait]
impl Service for ShardMetadataCache {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        *self.status.write() = ServiceStatus::Running;
        debug!(interval_secs = self.refresh_interval.as_secs(), "Shard metadata refresh started");

        let mut interval = tokio::time::interval(self.refresh_interval);
        // The first tick completes immediately
        interval.tick().await;
        while tick_or_shutdown(&mut interval, &mut shutdown).await {
            let refreshed = self.refresh_all().await;
            debug!(refreshed, "Shard metadata refresh cycle");
        }

        *self.status.write() = ServiceStatus::Stopped;
        debug!("Shard metadata refresh stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "shard_metadata"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
