use super::encoder::{encode, encode_json};
use super::filter::{LogFilter, TraceLink};
use super::{Level, LogConfig, Record};
use crate::batch::BatchLogProcessor;
use crate::self_metrics::SelfMetrics;
use crate::tps_debug;
use opentelemetry_proto::tonic::common::v1::any_value;
use opentelemetry_proto::tonic::logs::v1::LogRecord;
use std::fmt;
use std::sync::Arc;

/// Destination of encoded log records.
pub trait LogSink: Send + Sync + fmt::Debug + 'static {
    /// Takes ownership of one record. Must not block.
    fn emit(&self, record: LogRecord);
}

impl LogSink for BatchLogProcessor {
    fn emit(&self, record: LogRecord) {
        BatchLogProcessor::emit(self, record)
    }
}

impl<S: LogSink> LogSink for Arc<S> {
    fn emit(&self, record: LogRecord) {
        S::emit(self, record)
    }
}

/// Entry point for application logs.
///
/// Records below the configured level are dropped first, then flood control
/// and trace sampling run, and whatever survives is encoded and handed to the
/// sink. Logging never fails from the caller's point of view: records that
/// cannot be encoded are dropped with a debug event.
///
/// ```no_run
/// # use tpstelemetry::logs::{Level, LogConfig, Logger, LogSink, Record};
/// # use opentelemetry_proto::tonic::logs::v1::LogRecord;
/// # #[derive(Debug)] struct Stdout;
/// # impl LogSink for Stdout { fn emit(&self, record: LogRecord) { println!("{record:?}") } }
/// let logger = Logger::new(&LogConfig::default(), Stdout);
/// logger.log(Record::new(Level::Warn, "cache miss").with_field("key", "user:42"));
/// ```
#[derive(Clone, Debug)]
pub struct Logger {
    filter: Arc<LogFilter>,
    sink: Arc<dyn LogSink>,
    metrics: SelfMetrics,
}

impl Logger {
    /// Creates a logger counting into the global self-metrics.
    pub fn new(config: &LogConfig, sink: impl LogSink) -> Self {
        Self::with_self_metrics(config, sink, SelfMetrics::global().clone())
    }

    /// Creates a logger counting into `metrics`.
    pub fn with_self_metrics(config: &LogConfig, sink: impl LogSink, metrics: SelfMetrics) -> Self {
        Logger {
            filter: Arc::new(LogFilter::new(config)),
            sink: Arc::new(sink),
            metrics,
        }
    }

    /// Whether records at `level` pass the level threshold.
    pub fn enabled(&self, level: Level) -> bool {
        self.filter.enabled(level)
    }

    /// Filters, encodes and emits one record.
    pub fn log(&self, record: Record) {
        if !self.filter.enabled(record.level) {
            return;
        }
        self.metrics.log_level(record.level.as_str());
        if !self
            .filter
            .allow(record.level, &record.message, TraceLink::of_record(&record))
        {
            return;
        }
        match encode(&record) {
            Ok(encoded) => self.sink.emit(encoded),
            Err(err) => {
                tps_debug!(name: "Logger.InvalidRecord", error = format!("{err}"));
            }
        }
    }

    /// Filters and emits one JSON line produced by a zap-style JSON encoder.
    pub fn log_json(&self, line: &[u8]) {
        let encoded = match encode_json(line) {
            Ok(encoded) => encoded,
            Err(err) => {
                tps_debug!(name: "Logger.InvalidRecord", error = format!("{err}"));
                return;
            }
        };
        let level: Level = encoded.severity_text.parse().unwrap_or_default();
        if !self.filter.enabled(level) {
            return;
        }
        self.metrics.log_level(level.as_str());
        let message = match encoded.body.as_ref().and_then(|body| body.value.as_ref()) {
            Some(any_value::Value::StringValue(message)) => message.as_str(),
            _ => "",
        };
        if self
            .filter
            .allow(level, message, TraceLink::of_encoded(&encoded))
        {
            self.sink.emit(encoded);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::sync::Mutex;

    /// Collects emitted records.
    #[derive(Debug, Default)]
    pub(crate) struct MemorySink(pub(crate) Mutex<Vec<LogRecord>>);

    impl LogSink for MemorySink {
        fn emit(&self, record: LogRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    impl MemorySink {
        pub(crate) fn len(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::MemorySink;
    use super::*;
    use crate::logs::{RateLimitConfig, SPAN_ID_KEY, TRACE_ID_KEY};
    use prometheus::Registry;
    use std::time::Duration;

    fn logger(config: LogConfig) -> (Logger, Arc<MemorySink>, SelfMetrics) {
        let sink = Arc::new(MemorySink::default());
        let metrics = SelfMetrics::new(&Registry::new());
        let logger = Logger::with_self_metrics(&config, sink.clone(), metrics.clone());
        (logger, sink, metrics)
    }

    #[test]
    fn below_level_is_dropped_and_not_counted() {
        let (logger, sink, metrics) = logger(LogConfig {
            level: Level::Warn,
            ..Default::default()
        });
        logger.log(Record::new(Level::Info, "noise"));
        logger.log(Record::new(Level::Error, "boom"));
        assert_eq!(sink.len(), 1);
        assert_eq!(metrics.log_level_count("info"), 0);
        assert_eq!(metrics.log_level_count("error"), 1);
    }

    #[test]
    fn flood_of_identical_messages_is_thinned() {
        let (logger, sink, _) = logger(LogConfig {
            rate_limit: Some(RateLimitConfig {
                tick: Duration::from_secs(3600),
                first: 3,
                thereafter: 5,
            }),
            ..Default::default()
        });
        for _ in 0..20 {
            logger.log(Record::new(Level::Info, "upstream unavailable"));
        }
        assert_eq!(sink.len(), 6);
    }

    #[test]
    fn invalid_ids_are_dropped() {
        let (logger, sink, _) = logger(LogConfig::default());
        logger.log(Record::new(Level::Info, "m").with_field(TRACE_ID_KEY, "abcd"));
        logger.log(Record::new(Level::Info, "m").with_field(SPAN_ID_KEY, "zz"));
        logger.log_json(br#"{"level":"info","ts":1.0,"msg":"m","spanID":"0102"}"#);
        assert_eq!(sink.len(), 0);
    }

    #[test]
    fn json_path_applies_the_same_filters() {
        let (logger, sink, metrics) = logger(LogConfig {
            level: Level::Info,
            trace_sampled: true,
            ..Default::default()
        });
        let unsampled = br#"{"level":"info","ts":1.5,"msg":"m","traceID":"0af7651916cd43dd8448eb211c80319c","spanID":"b7ad6b7169203331","sampled":"false"}"#;
        let sampled = br#"{"level":"info","ts":1.5,"msg":"m","traceID":"0af7651916cd43dd8448eb211c80319c","spanID":"b7ad6b7169203331","sampled":"true"}"#;
        logger.log_json(br#"{"level":"debug","ts":1.5,"msg":"m"}"#);
        logger.log_json(unsampled);
        logger.log_json(sampled);
        logger.log_json(b"{not json");
        assert_eq!(sink.len(), 1);
        assert_eq!(metrics.log_level_count("info"), 2);
        assert_eq!(sink.0.lock().unwrap()[0].time_unix_nano, 1_500_000_000);
    }
}
