//! # Batch processing
//!
//! A [`BatchProcessor`] owns a bounded queue and a single worker task. The
//! worker exports the pending batch when any of these holds:
//!
//! * the batch holds `max_export_batch_size` items,
//! * the encoded size of the batch reached `max_packet_size`,
//! * `batch_timeout` passed since the previous export attempt.
//!
//! Failed batches are dropped; outcomes are counted in the self-metrics.
//! [`BatchSpanProcessor`], [`BatchLogProcessor`] and [`BatchMetricProcessor`]
//! adapt the core to each signal and compute item sizes once, at enqueue.
use serde::Deserialize;
use std::cmp::min;
use std::env;
use std::str::FromStr;
use std::time::Duration;

mod log;
mod metric;
mod processor;
mod span;

pub use log::BatchLogProcessor;
pub use metric::BatchMetricProcessor;
pub use processor::BatchProcessor;
pub use span::BatchSpanProcessor;

/// Delay interval between two consecutive exports of spans, in milliseconds.
pub const OTEL_BSP_SCHEDULE_DELAY: &str = "OTEL_BSP_SCHEDULE_DELAY";
/// Maximum queue size for spans.
pub const OTEL_BSP_MAX_QUEUE_SIZE: &str = "OTEL_BSP_MAX_QUEUE_SIZE";
/// Maximum number of spans per export, must not exceed the queue size.
pub const OTEL_BSP_MAX_EXPORT_BATCH_SIZE: &str = "OTEL_BSP_MAX_EXPORT_BATCH_SIZE";
/// Maximum allowed time to export spans, in milliseconds.
pub const OTEL_BSP_EXPORT_TIMEOUT: &str = "OTEL_BSP_EXPORT_TIMEOUT";

/// Delay interval between two consecutive exports of log records, in milliseconds.
pub const OTEL_BLRP_SCHEDULE_DELAY: &str = "OTEL_BLRP_SCHEDULE_DELAY";
/// Maximum queue size for log records.
pub const OTEL_BLRP_MAX_QUEUE_SIZE: &str = "OTEL_BLRP_MAX_QUEUE_SIZE";
/// Maximum number of log records per export, must not exceed the queue size.
pub const OTEL_BLRP_MAX_EXPORT_BATCH_SIZE: &str = "OTEL_BLRP_MAX_EXPORT_BATCH_SIZE";
/// Maximum allowed time to export log records, in milliseconds.
pub const OTEL_BLRP_EXPORT_TIMEOUT: &str = "OTEL_BLRP_EXPORT_TIMEOUT";

pub(crate) const DEFAULT_MAX_QUEUE_SIZE: usize = 2_048;
pub(crate) const DEFAULT_MAX_EXPORT_BATCH_SIZE: usize = 512;
pub(crate) const DEFAULT_MAX_PACKET_SIZE: usize = 2 * 1024 * 1024;
pub(crate) const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(5_000);
pub(crate) const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Names of the environment variables a [`BatchConfigBuilder`] reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchEnv {
    max_queue_size: &'static str,
    schedule_delay: &'static str,
    max_export_batch_size: &'static str,
    export_timeout: &'static str,
}

impl BatchEnv {
    /// The `OTEL_BSP_*` variables.
    pub const SPANS: BatchEnv = BatchEnv {
        max_queue_size: OTEL_BSP_MAX_QUEUE_SIZE,
        schedule_delay: OTEL_BSP_SCHEDULE_DELAY,
        max_export_batch_size: OTEL_BSP_MAX_EXPORT_BATCH_SIZE,
        export_timeout: OTEL_BSP_EXPORT_TIMEOUT,
    };

    /// The `OTEL_BLRP_*` variables.
    pub const LOGS: BatchEnv = BatchEnv {
        max_queue_size: OTEL_BLRP_MAX_QUEUE_SIZE,
        schedule_delay: OTEL_BLRP_SCHEDULE_DELAY,
        max_export_batch_size: OTEL_BLRP_MAX_EXPORT_BATCH_SIZE,
        export_timeout: OTEL_BLRP_EXPORT_TIMEOUT,
    };
}

/// Batch processor configuration.
/// Use [`BatchConfigBuilder`] to configure your own instance of [`BatchConfig`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// The maximum queue size to buffer items for delayed processing. If the
    /// queue gets full it drops the items. The default value is 2048.
    pub max_queue_size: usize,

    /// The maximum number of items in a single export. The default value is 512.
    pub max_export_batch_size: usize,

    /// Encoded size at which the pending batch is exported, zero to disable.
    /// The default value is 2 MiB.
    pub max_packet_size: usize,

    /// Maximum time between two export attempts. The default value is 5 seconds.
    #[serde(with = "crate::config::duration_ms")]
    pub batch_timeout: Duration,

    /// Upper bound of a single export, zero for none. The default value is 30 seconds.
    #[serde(with = "crate::config::duration_ms")]
    pub export_timeout: Duration,

    /// Wait for room in a full queue instead of dropping.
    pub blocking: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_export_batch_size: DEFAULT_MAX_EXPORT_BATCH_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            blocking: false,
        }
    }
}

impl BatchConfig {
    /// Applies the variables named by `vars` on top of `self`.
    pub fn with_env_overrides(self, vars: BatchEnv) -> Self {
        BatchConfigBuilder::from(self).init_from_env_vars(vars).build()
    }
}

/// A builder for creating [`BatchConfig`] instances.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl Default for BatchConfigBuilder {
    /// Create a new [`BatchConfigBuilder`] initialized with default values,
    /// overridden by the `OTEL_BSP_*` environment variables if set:
    /// * `OTEL_BSP_MAX_QUEUE_SIZE`
    /// * `OTEL_BSP_SCHEDULE_DELAY`
    /// * `OTEL_BSP_MAX_EXPORT_BATCH_SIZE`
    /// * `OTEL_BSP_EXPORT_TIMEOUT`
    fn default() -> Self {
        Self::from_env(BatchEnv::SPANS)
    }
}

impl From<BatchConfig> for BatchConfigBuilder {
    fn from(config: BatchConfig) -> Self {
        BatchConfigBuilder { config }
    }
}

impl BatchConfigBuilder {
    /// Defaults overridden by the variables named by `vars`.
    pub fn from_env(vars: BatchEnv) -> Self {
        BatchConfigBuilder::from(BatchConfig::default()).init_from_env_vars(vars)
    }

    /// Set max_queue_size for [`BatchConfigBuilder`].
    /// It's the maximum queue size to buffer items for delayed processing.
    /// If the queue gets full it will drop the items.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.config.max_queue_size = max_queue_size;
        self
    }

    /// Set max_export_batch_size for [`BatchConfigBuilder`].
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.config.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Set max_packet_size for [`BatchConfigBuilder`], zero disables the byte trigger.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.config.max_packet_size = max_packet_size;
        self
    }

    /// Set batch_timeout for [`BatchConfigBuilder`].
    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.config.batch_timeout = batch_timeout;
        self
    }

    /// Set export_timeout for [`BatchConfigBuilder`], zero for none.
    pub fn with_export_timeout(mut self, export_timeout: Duration) -> Self {
        self.config.export_timeout = export_timeout;
        self
    }

    /// Make producers wait for room in a full queue.
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.config.blocking = blocking;
        self
    }

    /// Builds a `BatchConfig` enforcing the following invariants:
    /// * `max_queue_size` is at least 1.
    /// * `max_export_batch_size` is between 1 and `max_queue_size`.
    pub fn build(self) -> BatchConfig {
        let mut config = self.config;
        config.max_queue_size = config.max_queue_size.max(1);
        config.max_export_batch_size = min(config.max_export_batch_size, config.max_queue_size).max(1);
        config
    }

    fn init_from_env_vars(mut self, vars: BatchEnv) -> Self {
        if let Some(max_queue_size) = env::var(vars.max_queue_size)
            .ok()
            .and_then(|queue_size| usize::from_str(&queue_size).ok())
        {
            self.config.max_queue_size = max_queue_size;
        }

        if let Some(scheduled_delay) = env::var(vars.schedule_delay)
            .ok()
            .and_then(|delay| u64::from_str(&delay).ok())
        {
            self.config.batch_timeout = Duration::from_millis(scheduled_delay);
        }

        if let Some(max_export_batch_size) = env::var(vars.max_export_batch_size)
            .ok()
            .and_then(|batch_size| usize::from_str(&batch_size).ok())
        {
            self.config.max_export_batch_size = max_export_batch_size;
        }

        if let Some(export_timeout) = env::var(vars.export_timeout)
            .ok()
            .and_then(|timeout| u64::from_str(&timeout).ok())
        {
            self.config.export_timeout = Duration::from_millis(export_timeout);
        }

        self
    }
}
