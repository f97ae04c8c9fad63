//! # OTLP exporters
//!
//! Three gRPC exporters, one per signal, built on a shared [`Connection`]
//! state machine:
//!
//! * `start` lazily dials the collector and launches the reconnect loop.
//! * `export` serialises sends through an async mutex and wraps every request
//!   in [`retry_with_backoff`](crate::retry::retry_with_backoff). A transport
//!   failure marks the connection broken; until the reconnect loop restores it,
//!   exports fail fast with [`ExportError::Disconnected`].
//! * `shutdown` drops the channel and stops the reconnect loop. A second call
//!   returns `Ok`.
//!
//! [`AsyncLogExporter`] fans log batches out to worker tasks in front of a
//! [`LogExporter`].
use crate::error::ExportResult;
use crate::grpc::DEFAULT_ENDPOINT;
use crate::retry::RetryConfig;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;

mod async_logs;
mod connection;
pub(crate) mod guard;
mod logs;
mod metrics;
mod trace;
pub(crate) mod utf8;

pub use async_logs::{AsyncLogConfig, AsyncLogExporter};
pub(crate) use connection::Connection;
pub use logs::LogExporter;
pub use metrics::MetricExporter;
pub use trace::TraceExporter;

/// Target to which the exporter is going to send signals, defaults to
/// `http://localhost:4317`.
pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
/// Max waiting time for the backend to process each batch, in milliseconds.
pub const OTEL_EXPORTER_OTLP_TIMEOUT: &str = "OTEL_EXPORTER_OTLP_TIMEOUT";
/// Default per-request timeout.
pub const OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT: Duration = Duration::from_millis(10_000);
/// Default minimum pause between two reconnect attempts.
pub const DEFAULT_RECONNECTION_PERIOD: Duration = Duration::from_secs(5);

/// Sends batches of one signal to the collector.
///
/// Implementations are driven by a batch processor, which calls `start` once
/// before the first export and `shutdown` after the last one.
pub trait Exporter: Send + Sync + fmt::Debug + 'static {
    /// What one batch is made of.
    type Item: Send + 'static;

    /// Dials the collector. Returns [`ExportError::AlreadyStarted`] on repeat
    /// and [`ExportError::Stopped`] after shutdown.
    ///
    /// [`ExportError::AlreadyStarted`]: crate::error::ExportError::AlreadyStarted
    /// [`ExportError::Stopped`]: crate::error::ExportError::Stopped
    fn start(&self) -> impl Future<Output = ExportResult> + Send;

    /// Sends one batch. `timeout` bounds the whole call including retries.
    fn export(
        &self,
        batch: Vec<Self::Item>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = ExportResult> + Send;

    /// Releases the connection. Idempotent.
    fn shutdown(&self) -> impl Future<Output = ExportResult> + Send;
}

/// Connection settings shared by the gRPC exporters.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExporterConfig {
    /// Collector address, `http://` for plaintext or `https://` for TLS.
    pub endpoint: String,
    /// Sent as the `x-tps-tenantid` header on every request.
    pub tenant_id: String,
    /// Per-request timeout.
    #[serde(with = "crate::config::duration_ms")]
    pub timeout: Duration,
    /// Minimum pause between two reconnect attempts.
    #[serde(with = "crate::config::duration_ms")]
    pub reconnection_period: Duration,
    /// Backoff applied to failed requests.
    pub retry: RetryConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        ExporterConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            tenant_id: String::new(),
            timeout: OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT,
            reconnection_period: DEFAULT_RECONNECTION_PERIOD,
            retry: RetryConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Config for `endpoint` with the remaining settings at their defaults.
    pub fn new(endpoint: impl Into<String>) -> Self {
        ExporterConfig {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Sets the tenant.
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the reconnect period.
    pub fn with_reconnection_period(mut self, period: Duration) -> Self {
        self.reconnection_period = period;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Applies `OTEL_EXPORTER_OTLP_ENDPOINT` and `OTEL_EXPORTER_OTLP_TIMEOUT`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var(OTEL_EXPORTER_OTLP_ENDPOINT) {
            if !endpoint.is_empty() {
                self.endpoint = endpoint;
            }
        }
        if let Some(timeout) = std::env::var(OTEL_EXPORTER_OTLP_TIMEOUT)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.timeout = Duration::from_millis(timeout);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_endpoint_and_timeout() {
        temp_env::with_vars(
            [
                (OTEL_EXPORTER_OTLP_ENDPOINT, Some("http://collector:4317")),
                (OTEL_EXPORTER_OTLP_TIMEOUT, Some("2500")),
            ],
            || {
                let config = ExporterConfig::default().with_env_overrides();
                assert_eq!(config.endpoint, "http://collector:4317");
                assert_eq!(config.timeout, Duration::from_millis(2500));
            },
        );
    }

    #[test]
    fn unparsable_timeout_keeps_default() {
        temp_env::with_vars(
            [
                (OTEL_EXPORTER_OTLP_ENDPOINT, None),
                (OTEL_EXPORTER_OTLP_TIMEOUT, Some("soon")),
            ],
            || {
                let config = ExporterConfig::default().with_env_overrides();
                assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
                assert_eq!(config.timeout, OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT);
            },
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: ExporterConfig =
            serde_yaml::from_str("endpoint: http://otel:4317\ntenant_id: t1\ntimeout: 3000\n")
                .unwrap();
        assert_eq!(config.endpoint, "http://otel:4317");
        assert_eq!(config.tenant_id, "t1");
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.reconnection_period, DEFAULT_RECONNECTION_PERIOD);
        assert!(config.retry.enabled);
    }
}
