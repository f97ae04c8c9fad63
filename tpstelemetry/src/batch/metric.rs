use super::{BatchConfig, BatchProcessor};
use crate::error::BatchResult;
use crate::exporter::Exporter;
use crate::self_metrics::{signal, SelfMetrics};
use opentelemetry_proto::tonic::metrics::v1::Metric;
use prost::Message;
use std::time::Duration;

/// Batches OTLP metrics for a metric exporter.
#[derive(Debug)]
pub struct BatchMetricProcessor {
    inner: BatchProcessor<Metric>,
}

impl BatchMetricProcessor {
    /// Creates a processor with `config`.
    pub fn new<E>(exporter: E, config: BatchConfig) -> Self
    where
        E: Exporter<Item = Metric>,
    {
        Self::with_self_metrics(exporter, config, SelfMetrics::global().clone())
    }

    /// Creates a processor counting into `metrics`.
    pub fn with_self_metrics<E>(exporter: E, config: BatchConfig, metrics: SelfMetrics) -> Self
    where
        E: Exporter<Item = Metric>,
    {
        BatchMetricProcessor {
            inner: BatchProcessor::new(exporter, config, signal::METRICS, metrics),
        }
    }

    /// Queues `metric`.
    pub fn push(&self, metric: Metric) {
        let size = metric.encoded_len();
        self.inner.submit(metric, size);
    }

    /// Exports everything queued so far.
    pub async fn force_flush(&self, timeout: Duration) -> BatchResult {
        self.inner.force_flush(timeout).await
    }

    /// Drains the queue and shuts the exporter down.
    pub async fn shutdown(&self, timeout: Duration) -> BatchResult {
        self.inner.shutdown(timeout).await
    }
}
