//! # tpstelemetry-admin
//!
//! Operator-facing HTTP endpoints for a process running the tpstelemetry
//! pipeline: a prometheus scrape of the RPC metrics, the process-wide trace
//! switch, the tracez span summary and, with the `pprof` feature, CPU
//! profiles.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use tpstelemetry::trace::SpanProcessor;
//! use tpstelemetry::{Config, Telemetry};
//! use tpstelemetry_admin::{tracez, AdminConfig, AdminServer};
//!
//! let admin = AdminConfig::default();
//! let (processor, querier) = tracez(&admin.tracez);
//! let processors: Vec<Box<dyn SpanProcessor>> = vec![Box::new(processor)];
//! let telemetry =
//!     Telemetry::init_with_span_processors(Config::default(), prometheus::Registry::new(), processors)
//!         .await?;
//! let mut server = AdminServer::from_telemetry(&telemetry)
//!     .with_tracez(querier)
//!     .bind(&admin.addr)
//!     .await?;
//! // ...
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate feature flags
//!
//! * `internal-logs` (default): diagnostics through `tracing`.
//! * `pprof`: `/debug/pprof/profile`.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod error;
#[cfg(feature = "pprof")]
pub mod profile;
pub mod server;
pub mod tracez;

pub use error::AdminError;
pub use server::{AdminConfig, AdminHandle, AdminServer};
pub use tracez::{tracez, TracezConfig, TracezProcessor, TracezQuerier};
