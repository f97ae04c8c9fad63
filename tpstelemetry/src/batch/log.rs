use super::{BatchConfig, BatchConfigBuilder, BatchEnv, BatchProcessor};
use crate::error::BatchResult;
use crate::exporter::Exporter;
use crate::self_metrics::{signal, SelfMetrics};
use opentelemetry_proto::tonic::logs::v1::LogRecord;
use std::time::Duration;

/// Batches encoded log records for a log exporter.
#[derive(Debug)]
pub struct BatchLogProcessor {
    inner: BatchProcessor<LogRecord>,
}

/// Bytes `record` adds to the `log_records` field of its scope wrapper.
pub(crate) fn encoded_size(record: &LogRecord) -> usize {
    prost::encoding::message::encoded_len(2, record)
}

impl BatchLogProcessor {
    /// Creates a processor with the `OTEL_BLRP_*` defaults.
    pub fn new<E>(exporter: E) -> Self
    where
        E: Exporter<Item = LogRecord>,
    {
        Self::with_config(exporter, BatchConfigBuilder::from_env(BatchEnv::LOGS).build())
    }

    /// Creates a processor with `config`.
    pub fn with_config<E>(exporter: E, config: BatchConfig) -> Self
    where
        E: Exporter<Item = LogRecord>,
    {
        Self::with_self_metrics(exporter, config, SelfMetrics::global().clone())
    }

    /// Creates a processor counting into `metrics`.
    pub fn with_self_metrics<E>(exporter: E, config: BatchConfig, metrics: SelfMetrics) -> Self
    where
        E: Exporter<Item = LogRecord>,
    {
        BatchLogProcessor {
            inner: BatchProcessor::new(exporter, config, signal::LOGS, metrics),
        }
    }

    /// Queues `record`. Never blocks unless the processor is configured as blocking.
    pub fn emit(&self, record: LogRecord) {
        let size = encoded_size(&record);
        self.inner.submit(record, size);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::string_attribute;
    use opentelemetry_proto::tonic::logs::v1::ScopeLogs;
    use prost::Message;

    #[test]
    fn size_matches_wrapper_growth() {
        let record = LogRecord {
            severity_text: "info".into(),
            attributes: vec![string_attribute("k", "v")],
            ..Default::default()
        };
        let empty = ScopeLogs::default().encoded_len();
        let wrapped = ScopeLogs {
            log_records: vec![record.clone()],
            ..Default::default()
        }
        .encoded_len();
        assert_eq!(encoded_size(&record), wrapped - empty);
    }
}
