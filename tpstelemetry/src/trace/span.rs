//! # Span
//!
//! A span is mutable until it ends; ending moves its [`SpanData`] to every
//! processor of the provider. Dropping a span ends it.
use crate::trace::{Event, SpanData, Tracer};
use opentelemetry::trace::{SpanContext, Status};
use opentelemetry::KeyValue;
use std::borrow::Cow;
use std::time::SystemTime;

/// Single operation within a trace.
#[derive(Debug)]
pub struct Span {
    span_context: SpanContext,
    data: Option<SpanData>,
    tracer: Tracer,
}

impl Span {
    pub(crate) fn new(span_context: SpanContext, data: Option<SpanData>, tracer: Tracer) -> Self {
        Span {
            span_context,
            data,
            tracer,
        }
    }

    fn with_data<F>(&mut self, f: F)
    where
        F: FnOnce(&mut SpanData),
    {
        if let Some(data) = self.data.as_mut() {
            f(data)
        }
    }

    /// Identity of this span.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Whether updates are recorded. False for dropped or ended spans.
    pub fn is_recording(&self) -> bool {
        self.data.is_some()
    }

    /// Sets one attribute, replacing an existing value for the same key.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        self.with_data(|data| {
            match data.attributes.iter().position(|kv| kv.key == attribute.key) {
                Some(pos) => data.attributes[pos] = attribute,
                None => data.attributes.push(attribute),
            }
        });
    }

    /// Sets several attributes.
    pub fn set_attributes<I: IntoIterator<Item = KeyValue>>(&mut self, attributes: I) {
        for attribute in attributes {
            self.set_attribute(attribute);
        }
    }

    /// Records an event now.
    pub fn add_event<T: Into<Cow<'static, str>>>(&mut self, name: T, attributes: Vec<KeyValue>) {
        self.add_event_with_timestamp(name, SystemTime::now(), attributes)
    }

    /// Records an event at `timestamp`.
    pub fn add_event_with_timestamp<T: Into<Cow<'static, str>>>(
        &mut self,
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) {
        self.with_data(|data| data.events.push(Event::new(name, timestamp, attributes)));
    }

    /// Sets the status. Values form a total order `Ok > Error > Unset` and a
    /// lower value never replaces a higher one.
    pub fn set_status(&mut self, status: Status) {
        self.with_data(|data| {
            if status > data.status {
                data.status = status;
            }
        });
    }

    /// Renames the span.
    pub fn update_name<T: Into<Cow<'static, str>>>(&mut self, new_name: T) {
        self.with_data(|data| data.name = new_name.into());
    }

    /// Ends the span now.
    pub fn end(&mut self) {
        self.ensure_ended(None);
    }

    /// Ends the span at `timestamp`.
    pub fn end_with_timestamp(&mut self, timestamp: SystemTime) {
        self.ensure_ended(Some(timestamp));
    }

    fn ensure_ended(&mut self, timestamp: Option<SystemTime>) {
        let mut data = match self.data.take() {
            Some(data) => data,
            None => return,
        };

        let provider = self.tracer.provider();
        if provider.is_shutdown() {
            return;
        }

        data.end_time = timestamp.unwrap_or_else(SystemTime::now);
        let processors = provider.span_processors();
        match processors.split_last() {
            Some((last, rest)) => {
                for processor in rest {
                    processor.on_end(data.clone());
                }
                last.on_end(data);
            }
            None => {}
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.ensure_ended(None);
    }
}

#[cfg(test)]
mod tests {
    use crate::sampler::Sampler;
    use crate::trace::test_utils::RecordingProcessor;
    use crate::trace::TracerProvider;
    use opentelemetry::trace::Status;
    use opentelemetry::KeyValue;
    use std::time::{Duration, SystemTime};

    fn setup() -> (TracerProvider, RecordingProcessor) {
        let recorder = RecordingProcessor::default();
        let provider = TracerProvider::builder()
            .with_sampler(Sampler::AlwaysOn)
            .with_span_processor(recorder.clone())
            .build();
        (provider, recorder)
    }

    #[test]
    fn status_only_moves_up() {
        let (provider, recorder) = setup();
        let mut span = provider.tracer("test").start("op");
        span.set_status(Status::error("boom"));
        span.set_status(Status::Unset);
        span.end();
        assert_eq!(recorder.ended()[0].status, Status::error("boom"));

        let mut span = provider.tracer("test").start("op");
        span.set_status(Status::Ok);
        span.set_status(Status::error("late"));
        span.end();
        assert_eq!(recorder.ended()[1].status, Status::Ok);
    }

    #[test]
    fn attributes_replace_by_key() {
        let (provider, recorder) = setup();
        let mut span = provider.tracer("test").start("op");
        span.set_attribute(KeyValue::new("k", "a"));
        span.set_attribute(KeyValue::new("k", "b"));
        span.add_event("evt", vec![KeyValue::new("x", "y")]);
        span.update_name("renamed");
        span.end();

        let data = &recorder.ended()[0];
        assert_eq!(data.name, "renamed");
        assert_eq!(data.attributes, vec![KeyValue::new("k", "b")]);
        assert_eq!(data.events.len(), 1);
    }

    #[test]
    fn end_is_idempotent_and_stops_recording() {
        let (provider, recorder) = setup();
        let mut span = provider.tracer("test").start("op");
        let end = SystemTime::now() + Duration::from_secs(1);
        span.end_with_timestamp(end);
        assert!(!span.is_recording());
        span.set_attribute(KeyValue::new("late", true));
        span.end();
        drop(span);

        let ended = recorder.ended();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].end_time, end);
        assert!(ended[0].attributes.is_empty());
    }
}
