//! # Tracing
//!
//! A [`TracerProvider`] owns the sampler, the id generator, the resource and an
//! ordered list of [`SpanProcessor`]s. [`Tracer::start`] asks the sampler for a
//! decision, hands recording spans to every processor's `on_start`, and on
//! [`Span::end`] the finished [`SpanData`] flows through the processors, usually
//! a [`DeferredSampleProcessor`] in front of a batch processor.
//!
//! A span's sampled flag is decided once at start and never changes.
use crate::error::BatchResult;
use futures_util::future::BoxFuture;
use opentelemetry::trace::{SpanContext, SpanId, SpanKind, Status};
use opentelemetry::KeyValue;
use std::borrow::Cow;
use std::fmt;
use std::time::{Duration, SystemTime};

mod deferred;
mod id_generator;
mod provider;
mod span;
mod switch;
mod tracer;
pub(crate) mod transform;

pub use deferred::{DeferredSampleConfig, DeferredSampleProcessor};
pub use id_generator::{IdGenerator, RandomIdGenerator};
pub use provider::{TracerProvider, TracerProviderBuilder};
pub use span::Span;
pub use switch::TraceSwitch;
pub use tracer::{remote_parent, SpanBuilder, Tracer};
pub use transform::group_spans_by_scope;

/// An event recorded on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Event name.
    pub name: Cow<'static, str>,
    /// When the event happened.
    pub timestamp: SystemTime,
    /// Event attributes.
    pub attributes: Vec<KeyValue>,
}

impl Event {
    /// Creates an event.
    pub fn new<T: Into<Cow<'static, str>>>(
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) -> Self {
        Event {
            name: name.into(),
            timestamp,
            attributes,
        }
    }
}

/// A link to another span.
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    /// The linked span.
    pub span_context: SpanContext,
    /// Link attributes.
    pub attributes: Vec<KeyValue>,
}

impl Link {
    /// Creates a link.
    pub fn new(span_context: SpanContext, attributes: Vec<KeyValue>) -> Self {
        Link {
            span_context,
            attributes,
        }
    }
}

/// Everything recorded about a span. Immutable once the span has ended.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanData {
    /// Identity and sampled flag.
    pub span_context: SpanContext,
    /// Parent span id, `SpanId::INVALID` for roots.
    pub parent_span_id: SpanId,
    /// Span kind.
    pub span_kind: SpanKind,
    /// Span name.
    pub name: Cow<'static, str>,
    /// Start time.
    pub start_time: SystemTime,
    /// End time, equal to the start time until the span ends.
    pub end_time: SystemTime,
    /// Attributes in insertion order.
    pub attributes: Vec<KeyValue>,
    /// Events in insertion order.
    pub events: Vec<Event>,
    /// Links.
    pub links: Vec<Link>,
    /// Span status.
    pub status: Status,
    /// Name of the tracer that created the span.
    pub scope_name: Cow<'static, str>,
}

impl SpanData {
    /// Wall-clock duration, zero when the clock went backwards.
    pub fn duration(&self) -> Duration {
        self.end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }

    /// Approximate payload size: events dominate span volume, so only event
    /// attribute keys and string values are counted.
    pub fn estimated_size(&self) -> usize {
        self.events
            .iter()
            .flat_map(|event| event.attributes.iter())
            .map(|kv| {
                let value_len = match &kv.value {
                    opentelemetry::Value::String(s) => s.as_str().len(),
                    _ => 0,
                };
                kv.key.as_str().len() + value_len
            })
            .sum()
    }

    /// Looks up a string attribute.
    pub fn attribute_str(&self, key: &str) -> Option<Cow<'_, str>> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.as_str())
    }
}

/// Hook invoked on span start and end.
///
/// `on_start` and `on_end` run on the instrumented thread and must not block.
pub trait SpanProcessor: Send + Sync + fmt::Debug {
    /// Called when a recording span starts.
    fn on_start(&self, span: &SpanData, parent: Option<&SpanContext>);

    /// Called when a recording span ends.
    fn on_end(&self, span: SpanData);

    /// Exports everything buffered so far.
    fn force_flush(&self, timeout: Duration) -> BoxFuture<'_, BatchResult>;

    /// Flushes and releases resources. Repeated calls return `Ok`.
    fn shutdown(&self, timeout: Duration) -> BoxFuture<'_, BatchResult>;
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use opentelemetry::trace::{TraceFlags, TraceId, TraceState};
    use std::sync::{Arc, Mutex};

    pub(crate) fn span_data(name: &'static str, sampled: bool) -> SpanData {
        let flags = if sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        let now = SystemTime::now();
        SpanData {
            span_context: SpanContext::new(
                TraceId::from_bytes([1; 16]),
                SpanId::from_bytes([2; 8]),
                flags,
                false,
                TraceState::default(),
            ),
            parent_span_id: SpanId::INVALID,
            span_kind: SpanKind::Internal,
            name: name.into(),
            start_time: now,
            end_time: now,
            attributes: Vec::new(),
            events: Vec::new(),
            links: Vec::new(),
            status: Status::Unset,
            scope_name: "test".into(),
        }
    }

    /// Records every span handed to it.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingProcessor {
        pub(crate) started: Arc<Mutex<Vec<SpanData>>>,
        pub(crate) ended: Arc<Mutex<Vec<SpanData>>>,
    }

    impl RecordingProcessor {
        pub(crate) fn ended(&self) -> Vec<SpanData> {
            self.ended.lock().unwrap().clone()
        }
    }

    impl SpanProcessor for RecordingProcessor {
        fn on_start(&self, span: &SpanData, _parent: Option<&SpanContext>) {
            self.started.lock().unwrap().push(span.clone());
        }

        fn on_end(&self, span: SpanData) {
            self.ended.lock().unwrap().push(span);
        }

        fn force_flush(&self, _timeout: Duration) -> BoxFuture<'_, BatchResult> {
            Box::pin(async { Ok(()) })
        }

        fn shutdown(&self, _timeout: Duration) -> BoxFuture<'_, BatchResult> {
            Box::pin(async { Ok(()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::span_data;
    use super::*;

    #[test]
    fn estimated_size_counts_event_strings_only() {
        let mut span = span_data("op", true);
        span.attributes.push(KeyValue::new("ignored", "not counted"));
        span.events.push(Event::new(
            "e",
            SystemTime::now(),
            vec![KeyValue::new("key", "value"), KeyValue::new("n", 10_i64)],
        ));
        assert_eq!(span.estimated_size(), "key".len() + "value".len() + "n".len());
    }

    #[test]
    fn duration_never_negative() {
        let mut span = span_data("op", true);
        span.end_time = span.start_time - Duration::from_secs(1);
        assert_eq!(span.duration(), Duration::ZERO);
    }
}
