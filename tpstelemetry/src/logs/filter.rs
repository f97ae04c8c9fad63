use super::rate_limiter::RateLimiter;
use super::record::{SAMPLED_KEY, TRACE_ID_KEY};
use super::{FieldValue, Level, LogConfig, Record};
use opentelemetry_proto::tonic::common::v1::any_value;
use opentelemetry_proto::tonic::logs::v1::LogRecord;

/// Sampling state of the trace a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TraceLink {
    /// The record carries no trace id.
    Untraced,
    /// The record's trace is sampled.
    Sampled,
    /// The record's trace is not sampled.
    Unsampled,
}

impl TraceLink {
    pub(crate) fn of_record(record: &Record) -> Self {
        match record.field(TRACE_ID_KEY) {
            Some(FieldValue::String(id)) if !id.is_empty() => {}
            _ => return TraceLink::Untraced,
        }
        match record.field(SAMPLED_KEY) {
            Some(FieldValue::Bool(true)) => TraceLink::Sampled,
            Some(FieldValue::String(s)) if s == "true" => TraceLink::Sampled,
            _ => TraceLink::Unsampled,
        }
    }

    pub(crate) fn of_encoded(record: &LogRecord) -> Self {
        if record.trace_id.is_empty() {
            return TraceLink::Untraced;
        }
        let sampled = record
            .attributes
            .iter()
            .find(|kv| kv.key == SAMPLED_KEY)
            .and_then(|kv| kv.value.as_ref())
            .is_some_and(|value| value.value == Some(any_value::Value::BoolValue(true)));
        if sampled {
            TraceLink::Sampled
        } else {
            TraceLink::Unsampled
        }
    }
}

/// Decides which records are emitted: the level threshold first, then flood
/// control, then trace sampling.
#[derive(Debug)]
pub(crate) struct LogFilter {
    level: Level,
    rate_limiter: Option<RateLimiter>,
    trace_sampled: bool,
    error_sample: bool,
}

impl LogFilter {
    pub(crate) fn new(config: &LogConfig) -> Self {
        LogFilter {
            level: config.level,
            rate_limiter: config.rate_limit.clone().map(RateLimiter::new),
            trace_sampled: config.trace_sampled,
            error_sample: config.error_sample,
        }
    }

    pub(crate) fn enabled(&self, level: Level) -> bool {
        level >= self.level
    }

    /// Runs the filters after the level check.
    pub(crate) fn allow(&self, level: Level, message: &str, link: TraceLink) -> bool {
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(level, message) {
                return false;
            }
        }
        if !self.trace_sampled || (self.error_sample && level >= Level::Error) {
            return true;
        }
        link != TraceLink::Unsampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::RateLimitConfig;
    use opentelemetry::trace::{SpanId, TraceId};
    use rstest::rstest;
    use std::time::Duration;

    fn filter(trace_sampled: bool, error_sample: bool) -> LogFilter {
        LogFilter::new(&LogConfig {
            level: Level::Info,
            trace_sampled,
            error_sample,
            ..Default::default()
        })
    }

    #[rstest]
    #[case(false, false, Level::Info, TraceLink::Unsampled, true)]
    #[case(true, false, Level::Info, TraceLink::Unsampled, false)]
    #[case(true, false, Level::Info, TraceLink::Sampled, true)]
    #[case(true, false, Level::Info, TraceLink::Untraced, true)]
    #[case(true, false, Level::Error, TraceLink::Unsampled, false)]
    #[case(true, true, Level::Error, TraceLink::Unsampled, true)]
    #[case(true, true, Level::Fatal, TraceLink::Unsampled, true)]
    #[case(true, true, Level::Warn, TraceLink::Unsampled, false)]
    fn trace_sampling(
        #[case] trace_sampled: bool,
        #[case] error_sample: bool,
        #[case] level: Level,
        #[case] link: TraceLink,
        #[case] emitted: bool,
    ) {
        assert_eq!(filter(trace_sampled, error_sample).allow(level, "m", link), emitted);
    }

    #[test]
    fn level_threshold() {
        let filter = filter(false, false);
        assert!(!filter.enabled(Level::Debug));
        assert!(filter.enabled(Level::Info));
        assert!(filter.enabled(Level::Panic));
    }

    #[test]
    fn rate_limit_applies_before_sampling() {
        let filter = LogFilter::new(&LogConfig {
            rate_limit: Some(RateLimitConfig {
                tick: Duration::from_secs(60),
                first: 1,
                thereafter: 0,
            }),
            ..Default::default()
        });
        assert!(filter.allow(Level::Info, "once", TraceLink::Untraced));
        assert!(!filter.allow(Level::Info, "once", TraceLink::Untraced));
    }

    #[test]
    fn links_agree_between_record_and_encoded_forms() {
        let trace = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap();
        let span = SpanId::from_hex("b7ad6b7169203331").unwrap();
        for sampled in [true, false] {
            let record = Record::new(Level::Info, "m").with_trace(trace, span, sampled);
            let encoded = crate::logs::encode(&record).unwrap();
            assert_eq!(TraceLink::of_record(&record), TraceLink::of_encoded(&encoded));
        }

        let plain = Record::new(Level::Info, "m");
        assert_eq!(TraceLink::of_record(&plain), TraceLink::Untraced);
        assert_eq!(
            TraceLink::of_encoded(&crate::logs::encode(&plain).unwrap()),
            TraceLink::Untraced
        );
    }
}
