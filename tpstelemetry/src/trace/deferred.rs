use crate::error::BatchResult;
use crate::tps_debug;
use crate::trace::{SpanData, SpanProcessor};
use futures_util::future::BoxFuture;
use opentelemetry::trace::{SpanContext, Status};
use serde::Deserialize;
use std::time::Duration;

/// Which unsampled spans survive to export.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct DeferredSampleConfig {
    /// Keep unsampled spans whose status is not `Ok`.
    pub sample_error: bool,
    /// Keep unsampled spans that took at least `slow_threshold`.
    pub sample_slow: bool,
    /// Duration above which a span counts as slow.
    #[serde(with = "crate::config::duration_ms")]
    pub slow_threshold: Duration,
}

impl DeferredSampleConfig {
    /// Whether any deferred rule is active. The sampler records instead of
    /// dropping when this holds.
    pub fn is_enabled(&self) -> bool {
        self.sample_error || self.sample_slow
    }
}

/// Tail-sampling filter placed in front of the span batch processor.
///
/// Spans the sampler marked record-only arrive here with full detail; the
/// filter forwards the ones that are sampled, failed or slow and drops the rest.
#[derive(Debug)]
pub struct DeferredSampleProcessor<P> {
    config: DeferredSampleConfig,
    next: P,
}

impl<P: SpanProcessor> DeferredSampleProcessor<P> {
    /// Wraps `next`, which receives the spans that are kept.
    pub fn new(config: DeferredSampleConfig, next: P) -> Self {
        DeferredSampleProcessor { config, next }
    }

    fn keep(&self, span: &SpanData) -> bool {
        if span.span_context.is_sampled() {
            return true;
        }
        if self.config.sample_error && span.status != Status::Ok {
            return true;
        }
        self.config.sample_slow && span.duration() >= self.config.slow_threshold
    }
}

impl<P: SpanProcessor> SpanProcessor for DeferredSampleProcessor<P> {
    fn on_start(&self, span: &SpanData, parent: Option<&SpanContext>) {
        self.next.on_start(span, parent);
    }

    fn on_end(&self, span: SpanData) {
        if self.keep(&span) {
            self.next.on_end(span);
        } else {
            tps_debug!(name: "DeferredSampleProcessor.Dropped", span_name = span.name.as_ref());
        }
    }

    fn force_flush(&self, timeout: Duration) -> BoxFuture<'_, BatchResult> {
        self.next.force_flush(timeout)
    }

    fn shutdown(&self, timeout: Duration) -> BoxFuture<'_, BatchResult> {
        self.next.shutdown(timeout)
    }
}
