use super::rpc::{RpcMetrics, Side};
use crate::self_metrics::SelfMetrics;
use crate::tps_warn;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{MetricFamily, MetricType};
use prometheus::Registry;
use std::cmp::Ordering;
use std::fmt;

/// Runs on the guarded families before they are returned.
pub type PostFilter = Box<dyn Fn(Vec<MetricFamily>) -> Vec<MetricFamily> + Send + Sync>;

/// Bounds what a registry exposes.
///
/// Each gathered family keeps at most `per_metric_limit` series; a family
/// over the limit raises the `high_cardinality_alarm` gauge for its name and,
/// for `rpc_client_*`/`rpc_server_*` families, resets that side's RPC vectors
/// once per gather so they stop growing. Across families at most
/// `total_metric_limit` series are returned: the family that crosses the
/// limit is cut and the rest are left out. A limit of zero disables it.
pub struct CardinalityGuard {
    registry: Registry,
    per_metric_limit: usize,
    total_metric_limit: usize,
    rpc: Option<RpcMetrics>,
    post_filter: Option<PostFilter>,
    metrics: SelfMetrics,
}

impl fmt::Debug for CardinalityGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardinalityGuard")
            .field("per_metric_limit", &self.per_metric_limit)
            .field("total_metric_limit", &self.total_metric_limit)
            .field("rpc", &self.rpc.is_some())
            .field("post_filter", &self.post_filter.is_some())
            .finish()
    }
}

impl CardinalityGuard {
    /// Guards `registry`.
    pub fn new(registry: Registry, per_metric_limit: usize, total_metric_limit: usize) -> Self {
        CardinalityGuard {
            registry,
            per_metric_limit,
            total_metric_limit,
            rpc: None,
            post_filter: None,
            metrics: SelfMetrics::global().clone(),
        }
    }

    /// Resets these RPC vectors when one of their families overflows.
    pub fn with_rpc_metrics(mut self, rpc: RpcMetrics) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Runs `filter` last on every gather.
    pub fn with_post_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Vec<MetricFamily>) -> Vec<MetricFamily> + Send + Sync + 'static,
    {
        self.post_filter = Some(Box::new(filter));
        self
    }

    /// Raises alarms on `metrics` instead of the global self-metrics.
    pub fn with_self_metrics(mut self, metrics: SelfMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// The guarded registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gathers the registry within the limits.
    pub fn gather(&self) -> Vec<MetricFamily> {
        let mut families = self.registry.gather();
        let gathered = families.len();
        let mut reset_client = false;
        let mut reset_server = false;
        let mut total = 0;
        let mut keep = gathered;

        for (i, family) in families.iter_mut().enumerate() {
            let count = family.get_metric().len();
            if self.per_metric_limit > 0 && count > self.per_metric_limit {
                truncate(family, self.per_metric_limit);
                self.metrics.high_cardinality(family.name());
                tps_warn!(
                    name: "CardinalityGuard.FamilyTruncated",
                    metric = family.name().to_string(),
                    series = count,
                    limit = self.per_metric_limit,
                );
                match Side::of_family(family.name()) {
                    Some(Side::Client) => reset_client = true,
                    Some(Side::Server) => reset_server = true,
                    None => {}
                }
            }

            if self.total_metric_limit > 0 {
                let count = family.get_metric().len();
                if total + count > self.total_metric_limit {
                    let room = self.total_metric_limit - total;
                    truncate(family, room);
                    keep = if room > 0 { i + 1 } else { i };
                    break;
                }
                total += count;
            }
        }
        if keep < gathered {
            tps_warn!(
                name: "CardinalityGuard.TotalLimitReached",
                limit = self.total_metric_limit,
                families_dropped = gathered - keep,
            );
            families.truncate(keep);
        }

        if let Some(rpc) = &self.rpc {
            if reset_client {
                rpc.reset(Side::Client);
            }
            if reset_server {
                rpc.reset(Side::Server);
            }
        }

        match &self.post_filter {
            Some(filter) => filter(families),
            None => families,
        }
    }
}

fn truncate(family: &mut MetricFamily, len: usize) {
    let mut metrics = family.get_metric().to_vec();
    metrics.truncate(len);
    family.set_metric(metrics);
}

/// Collector passing through only the `limit` largest series of the wrapped
/// collector once it exceeds `limit`.
///
/// Series are ranked by value (counter or gauge value, histogram sample
/// count); when over the limit, series with a value of at most one are
/// dropped first.
#[derive(Debug)]
pub struct TopK<C> {
    inner: C,
    limit: usize,
}

impl<C: Collector> TopK<C> {
    /// Wraps `inner`.
    pub fn new(inner: C, limit: usize) -> Self {
        TopK { inner, limit }
    }
}

fn rank(metric_type: MetricType, metric: &prometheus::proto::Metric) -> f64 {
    match metric_type {
        MetricType::COUNTER => metric.counter.value(),
        MetricType::GAUGE => metric.gauge.value(),
        MetricType::HISTOGRAM => metric.histogram.sample_count() as f64,
        MetricType::SUMMARY => metric.summary.sample_count() as f64,
        _ => metric.untyped.value(),
    }
}

impl<C: Collector> Collector for TopK<C> {
    fn desc(&self) -> Vec<&Desc> {
        self.inner.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.inner.collect();
        for family in &mut families {
            if family.get_metric().len() <= self.limit {
                continue;
            }
            let metric_type = family.get_field_type();
            let mut ranked: Vec<_> = family
                .get_metric()
                .iter()
                .map(|m| (rank(metric_type, m), m.clone()))
                .filter(|(value, _)| *value > 1.0)
                .collect();
            ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
            ranked.truncate(self.limit);
            family.set_metric(ranked.into_iter().map(|(_, m)| m).collect());
        }
        families
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::CodeMapper;
    use crate::metrics::rpc::RpcReport;
    use prometheus::{IntCounterVec, IntGauge, Opts};

    fn counter_vec(registry: &Registry, name: &str, series: usize) -> IntCounterVec {
        let vec = IntCounterVec::new(Opts::new(name, "test"), &["id"]).unwrap();
        registry.register(Box::new(vec.clone())).unwrap();
        for i in 0..series {
            vec.with_label_values(&[i.to_string().as_str()]).inc();
        }
        vec
    }

    fn series(families: &[MetricFamily]) -> usize {
        families.iter().map(|f| f.get_metric().len()).sum()
    }

    #[test]
    fn family_is_truncated_and_alarm_raised() {
        let registry = Registry::new();
        counter_vec(&registry, "requests_total", 25);
        let metrics = SelfMetrics::new(&Registry::new());
        let guard = CardinalityGuard::new(registry, 10, 0).with_self_metrics(metrics.clone());

        let families = guard.gather();
        assert_eq!(families[0].get_metric().len(), 10);
        assert!(metrics.high_cardinality_raised("requests_total"));
    }

    #[test]
    fn total_limit_cuts_family_list() {
        let registry = Registry::new();
        counter_vec(&registry, "a_total", 4);
        counter_vec(&registry, "b_total", 4);
        counter_vec(&registry, "c_total", 4);
        let guard = CardinalityGuard::new(registry, 0, 6);

        let families = guard.gather();
        assert_eq!(series(&families), 6);
        assert_eq!(families.len(), 2);
        assert_eq!(families[1].get_metric().len(), 2);
    }

    #[test]
    fn exact_total_keeps_following_family_out() {
        let registry = Registry::new();
        counter_vec(&registry, "a_total", 3);
        counter_vec(&registry, "b_total", 3);
        let guard = CardinalityGuard::new(registry, 0, 3);

        let families = guard.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(series(&families), 3);
    }

    #[test]
    fn overflowing_rpc_family_resets_its_side_once() {
        let registry = Registry::new();
        let rpc = RpcMetrics::new(&registry, CodeMapper::default()).unwrap();
        for i in 0..5 {
            rpc.report(
                Side::Client,
                &RpcReport {
                    callee_method: format!("/M{i}"),
                    ..Default::default()
                },
            );
        }
        rpc.report(Side::Server, &RpcReport::default());
        let guard = CardinalityGuard::new(registry.clone(), 3, 0)
            .with_rpc_metrics(rpc)
            .with_self_metrics(SelfMetrics::new(&Registry::new()));

        let first = guard.gather();
        // the alarmed families are still returned, truncated
        let client: Vec<_> = first
            .iter()
            .filter(|f| f.name().starts_with("rpc_client_"))
            .collect();
        assert_eq!(client.len(), 3);
        assert!(client.iter().all(|f| f.get_metric().len() == 3));

        let after = registry.gather();
        assert!(after
            .iter()
            .filter(|f| f.name().starts_with("rpc_client_"))
            .all(|f| f.get_metric().is_empty()));
        assert!(after
            .iter()
            .any(|f| f.name() == "rpc_server_started_total" && f.get_metric().len() == 1));
    }

    #[test]
    fn post_filter_runs_last() {
        let registry = Registry::new();
        counter_vec(&registry, "keep_total", 1);
        counter_vec(&registry, "drop_total", 1);
        let guard = CardinalityGuard::new(registry, 0, 0)
            .with_post_filter(|families| families.into_iter().filter(|f| f.name() != "drop_total").collect());

        let names: Vec<_> = guard.gather().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, ["keep_total"]);
    }

    #[test]
    fn top_k_keeps_largest_values_above_one() {
        let vec = IntCounterVec::new(Opts::new("hits_total", "test"), &["id"]).unwrap();
        for (id, hits) in [("a", 1), ("b", 9), ("c", 4), ("d", 7), ("e", 2)] {
            vec.with_label_values(&[id]).inc_by(hits);
        }
        let top = TopK::new(vec, 3);

        let families = top.collect();
        let values: Vec<_> = families[0]
            .get_metric()
            .iter()
            .map(|m| m.counter.value())
            .collect();
        assert_eq!(values, [9.0, 7.0, 4.0]);
    }

    #[test]
    fn top_k_drops_small_values_only_over_limit() {
        let gauge = IntGauge::new("queue_depth", "test").unwrap();
        gauge.set(1);
        let top = TopK::new(gauge, 1);
        assert_eq!(top.collect()[0].get_metric().len(), 1);

        let vec = IntCounterVec::new(Opts::new("ones_total", "test"), &["id"]).unwrap();
        for id in ["a", "b", "c"] {
            vec.with_label_values(&[id]).inc();
        }
        let top = TopK::new(vec, 2);
        assert!(top.collect()[0].get_metric().is_empty());
    }
}
