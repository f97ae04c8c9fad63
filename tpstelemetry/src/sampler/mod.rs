//! # Sampling
//!
//! Sampling decides, before a span starts, whether it is recorded and whether
//! it is marked sampled. [`TpsSampler`] is the production sampler:
//! probabilistic by trace id with per-service and per-method fractions, plus a
//! dyeing table that forces traces carrying matching attributes to be sampled.
//! The dyeing table is replaced by a [`DyeingSync`] daemon polling the control
//! plane.
use crate::trace::Link;
use opentelemetry::trace::{SamplingDecision, SamplingResult, SpanContext, SpanKind, TraceId};
use opentelemetry::KeyValue;
use std::fmt;

mod dyeing;
mod remote;
mod tps;

pub use dyeing::DyeingTable;
pub use remote::{DyeingSync, GrpcSamplerSource, SamplerSource};
pub use tps::{SamplerConfig, ServiceSamplerConfig, TpsSampler};

/// Decides whether a new span is recorded and sampled.
pub trait ShouldSample: Send + Sync + fmt::Debug {
    /// Returns the decision for a span about to start. `attributes` are the
    /// attributes known at start time; the returned attributes are appended
    /// to them.
    #[allow(clippy::too_many_arguments)]
    fn should_sample(
        &self,
        parent: Option<&SpanContext>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult;

    /// Stable human readable description.
    fn description(&self) -> String;
}

/// Fixed samplers, useful in tests and when sampling is configured off.
#[derive(Clone, Debug, PartialEq)]
pub enum Sampler {
    /// Every span is sampled.
    AlwaysOn,
    /// No span is recorded.
    AlwaysOff,
    /// Spans are sampled by trace id with the given fraction.
    TraceIdRatioBased(f64),
}

impl ShouldSample for Sampler {
    fn should_sample(
        &self,
        parent: Option<&SpanContext>,
        trace_id: TraceId,
        _name: &str,
        _span_kind: &SpanKind,
        _attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let decision = match self {
            Sampler::AlwaysOn => SamplingDecision::RecordAndSample,
            Sampler::AlwaysOff => SamplingDecision::Drop,
            Sampler::TraceIdRatioBased(fraction) => {
                if trace_id_keep(trace_id, fraction_upper_bound(*fraction)) {
                    SamplingDecision::RecordAndSample
                } else {
                    SamplingDecision::Drop
                }
            }
        };
        SamplingResult {
            decision,
            attributes: Vec::new(),
            trace_state: parent
                .map(|sc| sc.trace_state().clone())
                .unwrap_or_default(),
        }
    }

    fn description(&self) -> String {
        match self {
            Sampler::AlwaysOn => "AlwaysOnSampler".to_string(),
            Sampler::AlwaysOff => "AlwaysOffSampler".to_string(),
            Sampler::TraceIdRatioBased(fraction) => format!("TraceIdRatioBased{{{fraction}}}"),
        }
    }
}

/// Compiles a fraction into the exclusive upper bound compared against
/// [`trace_id_bits`]. Fractions are clamped into `[0, 1]`.
pub fn fraction_upper_bound(fraction: f64) -> u64 {
    if fraction.is_nan() || fraction <= 0.0 {
        0
    } else if fraction >= 1.0 {
        1 << 63
    } else {
        (fraction * (1u64 << 63) as f64) as u64
    }
}

/// The high 63 bits of the first eight bytes of the trace id.
pub fn trace_id_bits(trace_id: TraceId) -> u64 {
    let bytes = trace_id.to_bytes();
    let mut high = [0u8; 8];
    high.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(high) >> 1
}

/// Whether `trace_id` falls under the compiled `upper_bound`.
pub fn trace_id_keep(trace_id: TraceId, upper_bound: u64) -> bool {
    trace_id_bits(trace_id) < upper_bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{IdGenerator, RandomIdGenerator};
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 0)]
    #[case(-1.0, 0)]
    #[case(f64::NAN, 0)]
    #[case(0.5, 1 << 62)]
    #[case(1.0, 1 << 63)]
    #[case(3.0, 1 << 63)]
    fn upper_bound_is_clamped(#[case] fraction: f64, #[case] expected: u64) {
        assert_eq!(fraction_upper_bound(fraction), expected);
    }

    #[test]
    fn uses_high_bits_of_first_half() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x80;
        bytes[15] = 0xff;
        let id = TraceId::from_bytes(bytes);
        assert_eq!(trace_id_bits(id), 1 << 62);
        assert!(!trace_id_keep(id, fraction_upper_bound(0.5)));
        assert!(trace_id_keep(id, fraction_upper_bound(0.5000001)));
    }

    #[test]
    fn extreme_fractions_keep_all_or_none() {
        let generator = RandomIdGenerator::default();
        let all = fraction_upper_bound(1.0);
        let none = fraction_upper_bound(0.0);
        let max = TraceId::from_bytes([0xff; 16]);
        assert!(trace_id_keep(max, all));
        for _ in 0..1000 {
            let id = generator.new_trace_id();
            assert!(trace_id_keep(id, all));
            assert!(!trace_id_keep(id, none));
        }
    }

    #[test]
    fn predicate_is_monotone_and_converges() {
        let generator = RandomIdGenerator::default();
        let ids: Vec<_> = (0..20_000).map(|_| generator.new_trace_id()).collect();
        let fractions = [0.01, 0.1, 0.25, 0.5, 0.75, 0.9];
        let mut previous = 0;
        for fraction in fractions {
            let bound = fraction_upper_bound(fraction);
            let kept = ids.iter().filter(|id| trace_id_keep(**id, bound)).count();
            assert!(kept >= previous);
            previous = kept;
            let rate = kept as f64 / ids.len() as f64;
            assert!((rate - fraction).abs() < 0.02, "fraction {fraction} got {rate}");
        }
    }

    #[test]
    fn fixed_samplers() {
        let id = TraceId::from(1_u128);
        let on = Sampler::AlwaysOn.should_sample(None, id, "op", &SpanKind::Internal, &[], &[]);
        assert_eq!(on.decision, SamplingDecision::RecordAndSample);
        let off = Sampler::AlwaysOff.should_sample(None, id, "op", &SpanKind::Internal, &[], &[]);
        assert_eq!(off.decision, SamplingDecision::Drop);
        assert_eq!(Sampler::AlwaysOn.description(), "AlwaysOnSampler");
    }
}
