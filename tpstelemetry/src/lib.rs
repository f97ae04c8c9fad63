//! # tpstelemetry
//!
//! Client-side telemetry egress for RPC services: spans, logs and RPC metrics
//! are sampled, filtered, batched and delivered to an OTLP collector over gRPC
//! without ever blocking or failing the instrumented code.
//!
//! ```text
//!  Tracer::start ──► TpsSampler ──► Span::end ──► DeferredSampleProcessor ──► BatchSpanProcessor ──► TraceExporter
//!  Logger::log   ──► level / rate limit / trace-sampled filter ──► encode ──► BatchLogProcessor ──► LogExporter
//!  RpcMetrics    ──► prometheus Registry ──► CardinalityGuard ──► MetricPusher ──► BatchMetricProcessor ──► MetricExporter
//! ```
//!
//! Each exporter owns one long-lived connection with its own reconnect loop,
//! and wraps every request in an exponential backoff honouring server
//! throttling hints. The control plane feeds the [`codes::CodeMapper`], the
//! dyeing table of the [`sampler::TpsSampler`] and the exported resource.
//!
//! Most programs only need [`pipeline::Telemetry`]:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use tpstelemetry::config::Config;
//! use tpstelemetry::pipeline::Telemetry;
//! use std::time::Duration;
//!
//! let config = Config::from_yaml_file("tpstelemetry.yaml")?.with_env_overrides();
//! let mut telemetry = Telemetry::init(config).await?;
//! if let Some(tracer) = telemetry.tracer("checkout") {
//!     let mut span = tracer.start("charge");
//!     span.end();
//! }
//! telemetry.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate feature flags
//!
//! * `internal-logs` (default): diagnostics of the pipeline itself through `tracing`.
//! * `gzip` (default): gzip-compressed export requests.
//! * `tls`: `https://` collector endpoints.
//! * `etcd`: service registration in etcd.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod batch;
pub mod codes;
pub mod config;
pub mod error;
pub mod exporter;
mod grpc;
pub mod internal_logging;
pub mod logs;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod resource;
pub mod retry;
mod retry_classification;
mod runtime;
pub mod sampler;
pub mod self_metrics;
pub mod semconv;
pub mod trace;
mod transform;

pub use config::Config;
pub use error::{BatchError, ConfigError, ExportError, InitError, RegistryError, RemoteError};
pub use pipeline::Telemetry;
pub use resource::Resource;

#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}
