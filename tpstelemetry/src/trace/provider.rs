//! # Tracer Provider
//!
//! The `TracerProvider` owns the span processors, the sampler, the id generator
//! and the trace switch shared by every [`Tracer`] it hands out. Cloning a
//! provider creates a new reference to the same provider.
//!
//! Once shut down, tracers of the provider produce non-recording spans and
//! ended spans are no longer passed to processors.
use crate::error::{BatchError, BatchResult};
use crate::resource::Resource;
use crate::sampler::{Sampler, ShouldSample};
use crate::trace::{IdGenerator, RandomIdGenerator, SpanProcessor, TraceSwitch, Tracer};
use crate::{tps_debug, tps_info};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct TracerProviderInner {
    processors: Vec<Box<dyn SpanProcessor>>,
    sampler: Box<dyn ShouldSample>,
    id_generator: Box<dyn IdGenerator>,
    resource: Resource,
    switch: TraceSwitch,
    is_shutdown: AtomicBool,
}

/// Creator of [`Tracer`]s sharing one processing pipeline.
#[derive(Clone, Debug)]
pub struct TracerProvider {
    inner: Arc<TracerProviderInner>,
}

impl Default for TracerProvider {
    fn default() -> Self {
        TracerProvider::builder().build()
    }
}

impl TracerProvider {
    /// Creates a new [`TracerProviderBuilder`].
    pub fn builder() -> TracerProviderBuilder {
        TracerProviderBuilder::default()
    }

    /// Returns a tracer for the instrumentation scope `name`.
    pub fn tracer<T: Into<Cow<'static, str>>>(&self, name: T) -> Tracer {
        let name = name.into();
        if name.is_empty() {
            tps_info!(name: "TracerProvider.TracerNameEmpty");
        }
        Tracer::new(name, self.clone())
    }

    pub(crate) fn span_processors(&self) -> &[Box<dyn SpanProcessor>] {
        &self.inner.processors
    }

    pub(crate) fn sampler(&self) -> &dyn ShouldSample {
        self.inner.sampler.as_ref()
    }

    pub(crate) fn id_generator(&self) -> &dyn IdGenerator {
        self.inner.id_generator.as_ref()
    }

    /// Resource stamped on exported spans.
    pub fn resource(&self) -> &Resource {
        &self.inner.resource
    }

    /// The switch consulted on every span start.
    pub fn switch(&self) -> &TraceSwitch {
        &self.inner.switch
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Relaxed)
    }

    /// Flushes every processor, in order, each with the full `timeout`.
    pub async fn force_flush(&self, timeout: Duration) -> BatchResult {
        let mut first_error = None;
        for processor in self.span_processors() {
            if let Err(err) = processor.force_flush(timeout).await {
                tps_debug!(name: "TracerProvider.ForceFlushError", error = format!("{err}"));
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Shuts every processor down. Only the first call does any work; later
    /// calls return `Ok`.
    pub async fn shutdown(&self, timeout: Duration) -> BatchResult {
        if self
            .inner
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let mut first_error: Option<BatchError> = None;
        for processor in self.span_processors() {
            if let Err(err) = processor.shutdown(timeout).await {
                tps_debug!(name: "TracerProvider.ShutdownError", error = format!("{err}"));
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Builder for [`TracerProvider`].
#[derive(Debug, Default)]
pub struct TracerProviderBuilder {
    processors: Vec<Box<dyn SpanProcessor>>,
    sampler: Option<Box<dyn ShouldSample>>,
    id_generator: Option<Box<dyn IdGenerator>>,
    resource: Option<Resource>,
    switch: Option<TraceSwitch>,
}

impl TracerProviderBuilder {
    /// Appends a span processor. Processors run in the order they are added.
    pub fn with_span_processor<P: SpanProcessor + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Appends an already boxed span processor.
    pub fn with_boxed_span_processor(mut self, processor: Box<dyn SpanProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Sets the sampler, [`Sampler::AlwaysOn`] by default.
    pub fn with_sampler<T: ShouldSample + 'static>(self, sampler: T) -> Self {
        TracerProviderBuilder {
            sampler: Some(Box::new(sampler)),
            ..self
        }
    }

    /// Sets the id generator.
    pub fn with_id_generator<T: IdGenerator + 'static>(self, id_generator: T) -> Self {
        TracerProviderBuilder {
            id_generator: Some(Box::new(id_generator)),
            ..self
        }
    }

    /// Sets the resource.
    pub fn with_resource(self, resource: Resource) -> Self {
        TracerProviderBuilder {
            resource: Some(resource),
            ..self
        }
    }

    /// Shares an existing trace switch, typically the one the admin server flips.
    pub fn with_switch(self, switch: TraceSwitch) -> Self {
        TracerProviderBuilder {
            switch: Some(switch),
            ..self
        }
    }

    /// Builds the provider.
    pub fn build(self) -> TracerProvider {
        TracerProvider {
            inner: Arc::new(TracerProviderInner {
                processors: self.processors,
                sampler: self
                    .sampler
                    .unwrap_or_else(|| Box::new(Sampler::AlwaysOn)),
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Box::<RandomIdGenerator>::default()),
                resource: self.resource.unwrap_or_else(Resource::empty),
                switch: self.switch.unwrap_or_default(),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}
