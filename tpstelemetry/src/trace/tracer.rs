//! # Tracer
//!
//! Creates spans. The sampling decision is taken here, once per span, from the
//! parent context, the trace id and the attributes known at start time.
use crate::trace::{provider::TracerProvider, Link, Span, SpanData};
use opentelemetry::trace::{
    SamplingDecision, SpanContext, SpanKind, Status, TraceFlags, TraceId, TraceState,
};
use opentelemetry::KeyValue;
use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

/// Creates spans on behalf of one instrumentation scope.
#[derive(Clone)]
pub struct Tracer {
    scope_name: Cow<'static, str>,
    provider: TracerProvider,
}

impl fmt::Debug for Tracer {
    // The provider is omitted, it owns the processors and would make this noisy.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("name", &self.scope_name)
            .finish()
    }
}

/// Options for a span that has not started yet.
#[derive(Clone, Debug, Default)]
pub struct SpanBuilder {
    /// Span name.
    pub name: Cow<'static, str>,
    /// Span kind, `Internal` when unset.
    pub span_kind: Option<SpanKind>,
    /// Attributes known at start; the sampler sees these.
    pub attributes: Vec<KeyValue>,
    /// Links to other spans.
    pub links: Vec<Link>,
    /// Explicit start time.
    pub start_time: Option<SystemTime>,
    /// Parent span context, local or remote.
    pub parent: Option<SpanContext>,
}

impl SpanBuilder {
    /// Creates a builder for a span called `name`.
    pub fn from_name<T: Into<Cow<'static, str>>>(name: T) -> Self {
        SpanBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the span kind.
    pub fn with_kind(self, span_kind: SpanKind) -> Self {
        SpanBuilder {
            span_kind: Some(span_kind),
            ..self
        }
    }

    /// Sets the start attributes.
    pub fn with_attributes<I: IntoIterator<Item = KeyValue>>(self, attributes: I) -> Self {
        SpanBuilder {
            attributes: attributes.into_iter().collect(),
            ..self
        }
    }

    /// Sets the links.
    pub fn with_links(self, links: Vec<Link>) -> Self {
        SpanBuilder { links, ..self }
    }

    /// Sets an explicit start time.
    pub fn with_start_time<T: Into<SystemTime>>(self, start_time: T) -> Self {
        SpanBuilder {
            start_time: Some(start_time.into()),
            ..self
        }
    }

    /// Sets the parent span context.
    pub fn with_parent(self, parent: SpanContext) -> Self {
        SpanBuilder {
            parent: Some(parent),
            ..self
        }
    }

    /// Starts the span with `tracer`.
    pub fn start(self, tracer: &Tracer) -> Span {
        tracer.build(self)
    }
}

impl Tracer {
    pub(crate) fn new(scope_name: Cow<'static, str>, provider: TracerProvider) -> Self {
        Tracer {
            scope_name,
            provider,
        }
    }

    pub(crate) fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    /// Starts a root span called `name`.
    pub fn start<T: Into<Cow<'static, str>>>(&self, name: T) -> Span {
        self.build(SpanBuilder::from_name(name))
    }

    /// Starts a span called `name` under `parent`.
    pub fn start_with_parent<T: Into<Cow<'static, str>>>(
        &self,
        name: T,
        parent: &SpanContext,
    ) -> Span {
        self.build(SpanBuilder::from_name(name).with_parent(parent.clone()))
    }

    /// Returns a builder for a span called `name`.
    pub fn span_builder<T: Into<Cow<'static, str>>>(&self, name: T) -> SpanBuilder {
        SpanBuilder::from_name(name)
    }

    /// Starts a span from `builder`.
    pub fn build(&self, builder: SpanBuilder) -> Span {
        let provider = self.provider();
        let parent = builder.parent.as_ref().filter(|sc| sc.is_valid());

        // Nothing is recorded while tracing is switched off or after shutdown,
        // but the parent identity still flows to children.
        if provider.is_shutdown() || !provider.switch().is_enabled() {
            let span_context = parent.cloned().unwrap_or_else(SpanContext::empty_context);
            return Span::new(span_context, None, self.clone());
        }

        let trace_id = match parent {
            Some(sc) => sc.trace_id(),
            None => provider.id_generator().new_trace_id(),
        };
        let span_id = provider.id_generator().new_span_id();
        let span_kind = builder.span_kind.clone().unwrap_or(SpanKind::Internal);

        let result = provider.sampler().should_sample(
            parent,
            trace_id,
            &builder.name,
            &span_kind,
            &builder.attributes,
            &builder.links,
        );

        let parent_flags = parent.map(|sc| sc.trace_flags()).unwrap_or_default();
        let (flags, recording) = match result.decision {
            SamplingDecision::RecordAndSample => (parent_flags.with_sampled(true), true),
            SamplingDecision::RecordOnly => (parent_flags.with_sampled(false), true),
            SamplingDecision::Drop => (TraceFlags::default(), false),
        };
        let span_context = SpanContext::new(trace_id, span_id, flags, false, result.trace_state);

        if !recording {
            return Span::new(span_context, None, self.clone());
        }

        let mut attributes = builder.attributes;
        attributes.extend(result.attributes);
        let start_time = builder.start_time.unwrap_or_else(SystemTime::now);
        let data = SpanData {
            span_context: span_context.clone(),
            parent_span_id: parent.map(|sc| sc.span_id()).unwrap_or(opentelemetry::trace::SpanId::INVALID),
            span_kind,
            name: builder.name,
            start_time,
            end_time: start_time,
            attributes,
            events: Vec::new(),
            links: builder.links,
            status: Status::Unset,
            scope_name: self.scope_name.clone(),
        };

        for processor in provider.span_processors() {
            processor.on_start(&data, parent);
        }

        Span::new(span_context, Some(data), self.clone())
    }
}

/// Returns a remote parent context, used when a trace arrives from another process.
pub fn remote_parent(trace_id: TraceId, span_id: opentelemetry::trace::SpanId, sampled: bool) -> SpanContext {
    let flags = if sampled {
        TraceFlags::SAMPLED
    } else {
        TraceFlags::default()
    };
    SpanContext::new(trace_id, span_id, flags, true, TraceState::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{Sampler, ShouldSample};
    use crate::trace::test_utils::RecordingProcessor;
    use crate::trace::TraceSwitch;
    use opentelemetry::trace::{SamplingResult, SpanId};

    #[derive(Debug)]
    struct FixedSampler(SamplingDecision);

    impl ShouldSample for FixedSampler {
        fn should_sample(
            &self,
            parent: Option<&SpanContext>,
            _trace_id: TraceId,
            _name: &str,
            _span_kind: &SpanKind,
            _attributes: &[KeyValue],
            _links: &[Link],
        ) -> SamplingResult {
            SamplingResult {
                decision: self.0.clone(),
                attributes: vec![KeyValue::new("sampler", "fixed")],
                trace_state: parent.map(|sc| sc.trace_state().clone()).unwrap_or_default(),
            }
        }

        fn description(&self) -> String {
            "FixedSampler".into()
        }
    }

    fn provider_with(decision: SamplingDecision) -> (TracerProvider, RecordingProcessor) {
        let recorder = RecordingProcessor::default();
        let provider = TracerProvider::builder()
            .with_sampler(FixedSampler(decision))
            .with_span_processor(recorder.clone())
            .build();
        (provider, recorder)
    }

    #[test]
    fn record_and_sample_sets_flag_and_calls_processors() {
        let (provider, recorder) = provider_with(SamplingDecision::RecordAndSample);
        let tracer = provider.tracer("test");
        let span = tracer.start("op");
        assert!(span.span_context().is_sampled());
        assert!(span.is_recording());
        assert_eq!(recorder.started.lock().unwrap().len(), 1);
        drop(span);

        let ended = recorder.ended();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].name, "op");
        assert_eq!(ended[0].scope_name, "test");
        assert!(ended[0]
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == "sampler"));
    }

    #[test]
    fn record_only_records_without_sampled_flag() {
        let (provider, recorder) = provider_with(SamplingDecision::RecordOnly);
        let mut span = provider.tracer("test").start("op");
        assert!(!span.span_context().is_sampled());
        assert!(span.is_recording());
        span.end();
        assert_eq!(recorder.ended().len(), 1);
    }

    #[test]
    fn drop_produces_non_recording_span() {
        let (provider, recorder) = provider_with(SamplingDecision::Drop);
        let mut span = provider.tracer("test").start("op");
        assert!(!span.is_recording());
        assert!(span.span_context().is_valid());
        span.end();
        assert!(recorder.ended().is_empty());
        assert!(recorder.started.lock().unwrap().is_empty());
    }

    #[test]
    fn children_inherit_trace_id_and_parent() {
        let (provider, recorder) = provider_with(SamplingDecision::RecordAndSample);
        let tracer = provider.tracer("test");
        let mut parent = tracer.start("parent");
        let mut child = tracer.start_with_parent("child", parent.span_context());
        assert_eq!(
            child.span_context().trace_id(),
            parent.span_context().trace_id()
        );
        child.end();
        parent.end();

        let ended = recorder.ended();
        assert_eq!(ended[0].parent_span_id, ended[1].span_context.span_id());
    }

    #[test]
    fn disabled_switch_stops_recording() {
        let switch = TraceSwitch::new(false);
        let recorder = RecordingProcessor::default();
        let provider = TracerProvider::builder()
            .with_sampler(Sampler::AlwaysOn)
            .with_switch(switch.clone())
            .with_span_processor(recorder.clone())
            .build();

        let parent = remote_parent(TraceId::from(7_u128), SpanId::from(9_u64), true);
        let mut span = provider.tracer("test").start_with_parent("op", &parent);
        assert!(!span.is_recording());
        assert_eq!(span.span_context(), &parent);
        span.end();
        assert!(recorder.ended().is_empty());

        switch.set(true);
        provider.tracer("test").start("op").end();
        assert_eq!(recorder.ended().len(), 1);
    }
}
