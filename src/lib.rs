//! Kuba ShardQuery - sharded PromQL execution core
//!
//! This library evaluates range-vector PromQL expressions against a sharded
//! search backend that stores one document per sample:
//! - Query window normalization and sub-interval selection
//! - Series identity (fingerprint) caching with incremental refresh
//! - Scatter/gather over physical shards on bounded worker pools
//! - Operator merge engines that fold per-shard partial aggregates
//! - Shard metadata caching and result assembly with pagination

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

/// Configuration management with TOML support
pub mod config;

/// Prometheus metrics
pub mod metrics;

/// Tracing subscriber setup
pub mod telemetry;

/// Range-vector expression model
pub mod promql;

/// Supported range-vector operators
pub mod operator;

/// Query window normalization
pub mod window;

/// Search backend collaborator traits
pub mod backend;

/// Aggregation response decoding
pub mod bucket;

/// Bounded worker pools
pub mod pool;

/// Background service lifecycle
pub mod services;

/// Index shard metadata cache
pub mod shards;

/// Model update registry
pub mod models;

/// Series identity cache
pub mod tsid;

/// Scatter/gather executor
pub mod scatter;

/// Operator merge engines
pub mod merge;

/// Expression evaluation and result assembly
pub mod evaluator;

/// In-memory collaborators for tests and local runs
pub mod stubs;

// Re-export main types
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use evaluator::{Collaborators, Evaluator};
pub use operator::Operator;
pub use promql::{Expr, MatrixSelector, RangeSpec, VectorSelector};
pub use types::{Labels, Matrix, PageMatrix, Point, Query, QueryOutput, Series};
