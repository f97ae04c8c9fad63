use super::{FieldValue, Level, Logger, Record};
use std::borrow::Cow;
use tracing_core::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

// Events of this crate are its own diagnostics and never enter the pipeline.
const INTERNAL_TARGET: &str = env!("CARGO_PKG_NAME");

/// Visitor to record the message and fields of an event.
struct EventVisitor<'a> {
    record: &'a mut Record,
}

impl EventVisitor<'_> {
    fn push(&mut self, field: &Field, value: FieldValue) {
        if field.name() == "message" {
            self.record.message = Cow::Owned(value.to_text());
        } else {
            self.record.fields.push(super::Field {
                key: Cow::Borrowed(field.name()),
                value,
            });
        }
    }
}

impl Visit for EventVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, FieldValue::F64(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, FieldValue::I64(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, FieldValue::U64(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, FieldValue::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, FieldValue::from(value.to_string()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.push(field, FieldValue::from(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, FieldValue::from(format!("{value:?}")));
    }
}

/// Bridges `tracing` events into a [`Logger`].
///
/// The event's `message` becomes the log message, its call site the `caller`
/// and every other field a log field, so `traceID`, `spanID` and `sampled`
/// fields link the record to a trace.
///
/// ```no_run
/// # use tpstelemetry::logs::{LogConfig, Logger, LogSink, TpsLogLayer};
/// # use opentelemetry_proto::tonic::logs::v1::LogRecord;
/// # use tracing_subscriber::prelude::*;
/// # #[derive(Debug)] struct Sink;
/// # impl LogSink for Sink { fn emit(&self, _record: LogRecord) {} }
/// # fn sink() -> impl LogSink { Sink }
/// let logger = Logger::new(&LogConfig::default(), sink());
/// tracing_subscriber::registry().with(TpsLogLayer::new(logger)).init();
/// tracing::warn!(user = "u-1", "quota exceeded");
/// ```
#[derive(Debug, Clone)]
pub struct TpsLogLayer {
    logger: Logger,
}

impl TpsLogLayer {
    /// Creates a layer emitting into `logger`.
    pub fn new(logger: Logger) -> Self {
        TpsLogLayer { logger }
    }
}

impl<S> Layer<S> for TpsLogLayer
where
    S: tracing_core::Subscriber,
{
    fn on_event(&self, event: &tracing_core::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target() == INTERNAL_TARGET {
            return;
        }
        let level = Level::from(meta.level());
        if !self.logger.enabled(level) {
            return;
        }

        let mut record = Record::new(level, "");
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            record.caller = Some(format!("{file}:{line}"));
        }
        event.record(&mut EventVisitor {
            record: &mut record,
        });
        self.logger.log(record);
    }
}
