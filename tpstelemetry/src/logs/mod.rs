//! # Logs
//!
//! Application logs enter through a [`Logger`], either as typed [`Record`]s,
//! as JSON lines from a zap-style encoder or as `tracing` events through
//! [`TpsLogLayer`]. Each record goes through three filters in order:
//!
//! 1. the level threshold,
//! 2. optional flood control per (level, message), see [`RateLimitConfig`],
//! 3. optional trace sampling: a record linked to an unsampled trace is
//!    dropped unless `error_sample` lets errors through.
//!
//! Survivors are encoded to OTLP [`LogRecord`]s and handed to a [`LogSink`],
//! normally a [`BatchLogProcessor`].
//!
//! [`LogRecord`]: opentelemetry_proto::tonic::logs::v1::LogRecord
//! [`BatchLogProcessor`]: crate::batch::BatchLogProcessor
use crate::batch::BatchConfig;
use crate::exporter::AsyncLogConfig;
use serde::Deserialize;

mod encoder;
mod filter;
mod layer;
mod level;
mod logger;
mod rate_limiter;
mod record;

pub use encoder::{encode, encode_json, EncodeError};
pub use layer::TpsLogLayer;
pub use level::{Level, ParseLevelError};
pub use logger::{LogSink, Logger};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use record::{Field, FieldValue, Record, HEADER_KEYS, SAMPLED_KEY, SPAN_ID_KEY, TRACE_ID_KEY};

/// Log pipeline settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Whether the log pipeline is installed at all.
    pub enabled: bool,
    /// Records below this level are dropped.
    pub level: Level,
    /// Flood control, off when absent.
    pub rate_limit: Option<RateLimitConfig>,
    /// Drop records whose trace is not sampled.
    pub trace_sampled: bool,
    /// With `trace_sampled`, still emit records at error level and above.
    pub error_sample: bool,
    /// Batching of encoded records.
    pub batch: BatchConfig,
    /// Export through worker queues instead of directly, off when absent.
    pub async_export: Option<AsyncLogConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            enabled: true,
            level: Level::Info,
            rate_limit: None,
            trace_sampled: false,
            error_sample: false,
            batch: BatchConfig::default(),
            async_export: None,
        }
    }
}
