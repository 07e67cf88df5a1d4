//! Collaborator contracts
//!
//! The query core never talks to the search cluster directly. Request
//! construction, request execution, shard metadata, log-group metadata and
//! the downstream job scheduler are injected behind the traits below.
//! [`crate::stubs`] provides in-memory implementations.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::operator::Operator;
use crate::promql::VectorSelector;
use crate::types::{Tsid, LABELS_STR_FIELD, TSID_FIELD};

/// Input of the request builder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSpec {
    /// Metric and label matchers
    pub selector: VectorSelector,
    /// Inclusive start (ms)
    pub start: i64,
    /// Exclusive end (ms)
    pub end: i64,
    /// Nested terms aggregation fields, outermost first
    pub group_by: Vec<String>,
    /// Per-bucket value aggregation; `None` lists series without a histogram
    pub aggregation: Option<Operator>,
    /// Fixed histogram interval (ms)
    pub interval: Option<i64>,
    /// Histogram key offset (ms)
    pub offset: i64,
    /// Raw must clauses appended to the query
    pub must: Vec<Value>,
    /// Whether the target indices carry `__tsid`
    pub tsid_path: bool,
    /// Terms size of the outermost aggregation
    pub size: Option<usize>,
}

/// A built search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Request body
    pub body: Value,
}

/// Builds search requests ("DSL builder")
///
/// Failures surface as `Exec` errors.
pub trait RequestBuilder: Send + Sync + 'static {
    /// Build the request for `spec`
    fn build(&self, spec: &RequestSpec) -> Result<SearchRequest>;
}

/// Executes search requests
#[async_trait]
pub trait SearchClient: Send + Sync + 'static {
    /// Execute against `indices`, optionally pinned to one shard through a
    /// preference string, returning the raw JSON response
    async fn execute(
        &self,
        request: &SearchRequest,
        indices: &[String],
        shard: Option<u32>,
        preference: Option<&str>,
    ) -> Result<Bytes>;
}

/// Source of index shard layouts
#[async_trait]
pub trait ShardMetadataSource: Send + Sync + 'static {
    /// JSON array describing the indices matching `pattern`
    async fn load_index_shards(&self, pattern: &str) -> Result<Bytes>;
}

/// A resolved log group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogGroup {
    /// Index patterns holding the group's data
    pub index_patterns: Vec<String>,
    /// Filter clause baked into the group
    pub must_filter: Option<Value>,
}

/// Source of log group / data view metadata
#[async_trait]
pub trait LogGroupSource: Send + Sync + 'static {
    /// Resolve a group identifier
    async fn resolve(&self, group_id: &str) -> Result<LogGroup>;
}

/// Downstream job runner notified after model updates
#[async_trait]
pub trait JobScheduler: Send + Sync + 'static {
    /// Re-plan the schedule of `model_id`
    async fn reschedule(&self, model_id: &str) -> Result<()>;
}

/// Wall clock in milliseconds
pub trait Clock: Send + Sync + 'static {
    /// Current time (ms since epoch)
    fn now_ms(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Shard preference string pinning a request to one shard
pub fn shard_preference(shard: u32) -> String {
    format!("_shards:{}", shard)
}

/// Must clause restricting to a set of fingerprints
pub fn tsid_terms(tsids: &[Tsid]) -> Value {
    json!({ "terms": { TSID_FIELD: tsids } })
}

/// Must clause restricting to a set of canonical label strings
pub fn labels_str_terms(labels: &[String]) -> Value {
    json!({ "terms": { LABELS_STR_FIELD: labels } })
}

/// Must clause selecting fingerprints strictly after `offset`
pub fn tsid_after(offset: &str) -> Value {
    json!({ "range": { TSID_FIELD: { "gt": offset } } })
}
