//! Metrics describing the pipeline itself.
//!
//! These are the only health signal of the pipeline: callers of `start`, `log`
//! and `report` never see errors.
use crate::tps_warn;
use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

/// Signal label values.
pub mod signal {
    /// Spans.
    pub const TRACE: &str = "trace";
    /// Log records.
    pub const LOGS: &str = "logs";
    /// Metrics.
    pub const METRICS: &str = "metrics";
}

/// Why a batch was sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchTrigger {
    /// The batch reached the item limit.
    Size,
    /// The batch reached the byte limit.
    Bytes,
    /// The batch timer fired.
    Timer,
    /// A caller asked for a flush.
    Flush,
    /// The processor is shutting down.
    Shutdown,
}

impl BatchTrigger {
    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchTrigger::Size => "batchsize",
            BatchTrigger::Bytes => "batchbytes",
            BatchTrigger::Timer => "batchtimer",
            BatchTrigger::Flush => "flush",
            BatchTrigger::Shutdown => "shutdown",
        }
    }
}

/// Collectors for the pipeline's own health.
///
/// Clones share the collectors.
#[derive(Clone, Debug)]
pub struct SelfMetrics {
    batch_process: IntCounterVec,
    batched: IntCounterVec,
    dropped: IntCounterVec,
    sdk_panic: IntCounter,
    logs_level: IntCounterVec,
    high_cardinality: IntGaugeVec,
}

static GLOBAL: OnceLock<SelfMetrics> = OnceLock::new();

impl SelfMetrics {
    /// Creates the collectors and registers them on `registry`. Registration
    /// failures are logged and the collectors still count.
    pub fn new(registry: &Registry) -> Self {
        let metrics = SelfMetrics::unregistered();
        let collectors: [Box<dyn prometheus::core::Collector>; 6] = [
            Box::new(metrics.batch_process.clone()),
            Box::new(metrics.batched.clone()),
            Box::new(metrics.dropped.clone()),
            Box::new(metrics.sdk_panic.clone()),
            Box::new(metrics.logs_level.clone()),
            Box::new(metrics.high_cardinality.clone()),
        ];
        for collector in collectors {
            if let Err(err) = registry.register(collector) {
                tps_warn!(name: "SelfMetrics.RegisterFailed", error = format!("{err}"));
            }
        }
        metrics
    }

    /// Collectors registered on the prometheus default registry.
    pub fn global() -> &'static SelfMetrics {
        GLOBAL.get_or_init(|| SelfMetrics::new(prometheus::default_registry()))
    }

    fn unregistered() -> Self {
        // Metric names and label sets are static, construction cannot fail.
        fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
            IntCounterVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|_| unreachable!("static metric definition {name}"))
        }
        SelfMetrics {
            batch_process: counter_vec(
                "batch_process_total",
                "Exported batches by signal and outcome.",
                &["signal", "status"],
            ),
            batched: counter_vec(
                "batched_total",
                "Batches sent by signal and trigger.",
                &["signal", "trigger"],
            ),
            dropped: counter_vec(
                "dropped_total",
                "Items dropped before export.",
                &["signal"],
            ),
            sdk_panic: IntCounter::new("sdk_panic_total", "Panics recovered during export.")
                .unwrap_or_else(|_| unreachable!("static metric definition sdk_panic_total")),
            logs_level: counter_vec(
                "logs_level_total",
                "Log records accepted by level.",
                &["level"],
            ),
            high_cardinality: IntGaugeVec::new(
                Opts::new(
                    "high_cardinality_alarm",
                    "Set when a metric family exceeded its series limit.",
                ),
                &["metric"],
            )
            .unwrap_or_else(|_| unreachable!("static metric definition high_cardinality_alarm")),
        }
    }

    /// Counts a finished export.
    pub fn batch_processed(&self, signal: &str, success: bool) {
        let status = if success { "success" } else { "failed" };
        self.batch_process
            .with_label_values(&[signal, status])
            .inc();
    }

    /// Counts a batch handed to the exporter.
    pub fn batched(&self, signal: &str, trigger: BatchTrigger) {
        self.batched
            .with_label_values(&[signal, trigger.as_str()])
            .inc();
    }

    /// Counts dropped items.
    pub fn dropped(&self, signal: &str, count: u64) {
        self.dropped.with_label_values(&[signal]).inc_by(count);
    }

    /// Counts a recovered panic.
    pub fn sdk_panic(&self) {
        self.sdk_panic.inc();
    }

    /// Counts an accepted log record.
    pub fn log_level(&self, level: &str) {
        self.logs_level.with_label_values(&[level]).inc();
    }

    /// Raises the high cardinality alarm for `metric`.
    pub fn high_cardinality(&self, metric: &str) {
        self.high_cardinality.with_label_values(&[metric]).set(1);
    }

    /// Current value of `dropped_total{signal}`.
    pub fn dropped_count(&self, signal: &str) -> u64 {
        self.dropped.with_label_values(&[signal]).get()
    }

    /// Current value of `batched_total{signal,trigger}`.
    pub fn batched_count(&self, signal: &str, trigger: BatchTrigger) -> u64 {
        self.batched
            .with_label_values(&[signal, trigger.as_str()])
            .get()
    }

    /// Current value of `batch_process_total{signal,status}`.
    pub fn batch_processed_count(&self, signal: &str, success: bool) -> u64 {
        let status = if success { "success" } else { "failed" };
        self.batch_process
            .with_label_values(&[signal, status])
            .get()
    }

    /// Current value of `sdk_panic_total`.
    pub fn sdk_panic_count(&self) -> u64 {
        self.sdk_panic.get()
    }

    /// Current value of `logs_level_total{level}`.
    pub fn log_level_count(&self, level: &str) -> u64 {
        self.logs_level.with_label_values(&[level]).get()
    }

    /// Whether the alarm for `metric` is raised.
    pub fn high_cardinality_raised(&self, metric: &str) -> bool {
        self.high_cardinality.with_label_values(&[metric]).get() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_counts() {
        let registry = Registry::new();
        let metrics = SelfMetrics::new(&registry);
        metrics.batched(signal::TRACE, BatchTrigger::Timer);
        metrics.dropped(signal::LOGS, 2);
        metrics.batch_processed(signal::METRICS, false);
        metrics.high_cardinality("rpc_client_handled_total");

        assert_eq!(metrics.batched_count(signal::TRACE, BatchTrigger::Timer), 1);
        assert_eq!(metrics.dropped_count(signal::LOGS), 2);
        assert_eq!(metrics.batch_processed_count(signal::METRICS, false), 1);
        assert!(metrics.high_cardinality_raised("rpc_client_handled_total"));

        let names: Vec<_> = registry
            .gather()
            .iter()
            .map(|mf| mf.name().to_string())
            .collect();
        assert!(names.contains(&"batched_total".to_string()));
        assert!(names.contains(&"high_cardinality_alarm".to_string()));
    }

    #[test]
    fn double_registration_is_tolerated() {
        let registry = Registry::new();
        let _first = SelfMetrics::new(&registry);
        let second = SelfMetrics::new(&registry);
        second.sdk_panic();
        assert_eq!(second.sdk_panic_count(), 1);
    }
}
