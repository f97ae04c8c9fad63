//! # Metrics
//!
//! RPC metrics are recorded on a prometheus [`Registry`](prometheus::Registry)
//! by [`RpcMetrics`], with every code classified through a
//! [`CodeMapper`](crate::codes::CodeMapper). Whatever reads the registry,
//! either the admin `/metrics` endpoint or the [`MetricPusher`], goes through
//! a [`CardinalityGuard`] so a label explosion cannot flood the backend.
use crate::batch::BatchConfig;
use serde::Deserialize;
use std::time::Duration;

mod guard;
mod push;
mod rpc;
mod transform;

pub use guard::{CardinalityGuard, PostFilter, TopK};
pub use push::{MetricPusher, MetricSink};
pub use rpc::{RpcMetrics, RpcReport, RpcType, Side};
pub use transform::{families_to_metrics, family_to_metric, Timestamps};

/// Default series limit per family.
pub const DEFAULT_PER_METRIC_LIMIT: usize = 1000;
/// Default series limit across all families.
pub const DEFAULT_TOTAL_METRIC_LIMIT: usize = 10_000;

/// Metric pipeline settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are pushed to the collector.
    pub enabled: bool,
    /// Time between two pushes.
    #[serde(with = "crate::config::duration_ms")]
    pub push_interval: Duration,
    /// Series kept per family, zero for no limit.
    pub per_metric_limit: usize,
    /// Series kept across families, zero for no limit.
    pub total_metric_limit: usize,
    /// Label the RPC families with the streaming shape of the call.
    pub with_rpc_type: bool,
    /// Batching of pushed metrics.
    pub batch: BatchConfig,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            push_interval: Duration::from_secs(60),
            per_metric_limit: DEFAULT_PER_METRIC_LIMIT,
            total_metric_limit: DEFAULT_TOTAL_METRIC_LIMIT,
            with_rpc_type: false,
            batch: BatchConfig::default(),
        }
    }
}
