use super::{BatchConfig, BatchConfigBuilder, BatchProcessor};
use crate::error::BatchResult;
use crate::exporter::Exporter;
use crate::self_metrics::{signal, SelfMetrics};
use crate::trace::{SpanData, SpanProcessor};
use futures_util::future::BoxFuture;
use opentelemetry::trace::SpanContext;
use std::time::Duration;

/// Batches ended spans for a span exporter.
///
/// Every span reaching `on_end` is exported: the sampled flag was settled by
/// the sampler and, in deferred mode, by the processor in front of this one.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    inner: BatchProcessor<SpanData>,
}

impl BatchSpanProcessor {
    /// Creates a processor with `config`.
    pub fn new<E>(exporter: E, config: BatchConfig) -> Self
    where
        E: Exporter<Item = SpanData>,
    {
        Self::with_self_metrics(exporter, config, SelfMetrics::global().clone())
    }

    /// Creates a processor counting into `metrics`.
    pub fn with_self_metrics<E>(exporter: E, config: BatchConfig, metrics: SelfMetrics) -> Self
    where
        E: Exporter<Item = SpanData>,
    {
        BatchSpanProcessor {
            inner: BatchProcessor::new(exporter, config, signal::TRACE, metrics),
        }
    }

    /// Builder with the `OTEL_BSP_*` defaults.
    pub fn builder<E>(exporter: E) -> BatchSpanProcessorBuilder<E>
    where
        E: Exporter<Item = SpanData>,
    {
        BatchSpanProcessorBuilder {
            exporter,
            config: BatchConfigBuilder::default().build(),
            metrics: None,
        }
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_start(&self, _span: &SpanData, _parent: Option<&SpanContext>) {
        // Ignored
    }

    fn on_end(&self, span: SpanData) {
        let size = span.estimated_size();
        self.inner.submit(span, size);
    }

    fn force_flush(&self, timeout: Duration) -> BoxFuture<'_, BatchResult> {
        Box::pin(self.inner.force_flush(timeout))
    }

    fn shutdown(&self, timeout: Duration) -> BoxFuture<'_, BatchResult> {
        Box::pin(self.inner.shutdown(timeout))
    }
}

/// Builder for [`BatchSpanProcessor`].
#[derive(Debug)]
pub struct BatchSpanProcessorBuilder<E> {
    exporter: E,
    config: BatchConfig,
    metrics: Option<SelfMetrics>,
}

impl<E> BatchSpanProcessorBuilder<E>
where
    E: Exporter<Item = SpanData>,
{
    /// Replaces the batch configuration.
    pub fn with_batch_config(self, config: BatchConfig) -> Self {
        BatchSpanProcessorBuilder { config, ..self }
    }

    /// Counts into `metrics` instead of the global self-metrics.
    pub fn with_self_metrics(self, metrics: SelfMetrics) -> Self {
        BatchSpanProcessorBuilder {
            metrics: Some(metrics),
            ..self
        }
    }

    /// Spawns the worker.
    pub fn build(self) -> BatchSpanProcessor {
        let metrics = self
            .metrics
            .unwrap_or_else(|| SelfMetrics::global().clone());
        BatchSpanProcessor::with_self_metrics(self.exporter, self.config, metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportResult;
    use crate::trace::test_utils::span_data;
    use prometheus::Registry;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug, Default)]
    struct SpanSink(Arc<Mutex<Vec<Vec<SpanData>>>>);

    impl Exporter for SpanSink {
        type Item = SpanData;

        async fn start(&self) -> ExportResult {
            Ok(())
        }

        async fn export(&self, batch: Vec<SpanData>, _timeout: Option<Duration>) -> ExportResult {
            self.0.lock().unwrap().push(batch);
            Ok(())
        }

        async fn shutdown(&self) -> ExportResult {
            Ok(())
        }
    }

    #[tokio::test]
    async fn exports_sampled_and_kept_spans() {
        let sink = SpanSink::default();
        let processor = BatchSpanProcessor::builder(sink.clone())
            .with_batch_config(
                BatchConfigBuilder::from(BatchConfig::default())
                    .with_batch_timeout(Duration::from_secs(3600))
                    .build(),
            )
            .with_self_metrics(SelfMetrics::new(&Registry::new()))
            .build();

        processor.on_end(span_data("a", true));
        processor.on_end(span_data("b", false));
        processor.force_flush(Duration::from_secs(5)).await.unwrap();

        let batches = sink.0.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        let names: Vec<_> = batches[0].iter().map(|s| s.name.to_string()).collect();
        assert_eq!(names, ["a", "b"]);
        processor.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
