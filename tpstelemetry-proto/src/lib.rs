//! Control-plane messages and gRPC clients used by `tpstelemetry`.
//!
//! The Rust sources under `src/proto/tonic` are generated from
//! `src/proto/tps/control/v1/control.proto` with `tonic-prost-build` and checked in, so
//! building this crate needs no `protoc`.
//!
//! ## Features
//!
//! - `with-serde`: serde `Serialize`/`Deserialize` on every message.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod proto;

pub use proto::tonic;
