use super::{fraction_upper_bound, trace_id_keep, DyeingTable, ShouldSample};
use crate::semconv;
use crate::trace::Link;
use crate::tps_debug;
use opentelemetry::trace::{
    SamplingDecision, SamplingResult, SpanContext, SpanKind, TraceId, TraceState,
};
use opentelemetry::KeyValue;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
const DYEING_DEBUG_ENV: &str = "DyeingSamplerDebug";

/// Sampling fractions of one callee service.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceSamplerConfig {
    /// Fraction for methods without their own entry, the global fraction when unset.
    pub fraction: Option<f64>,
    /// Per-method fractions.
    pub methods: HashMap<String, f64>,
}

/// Configuration of [`TpsSampler`].
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerConfig {
    /// Fraction applied when no service override matches.
    pub fraction: f64,
    /// Tenant reported in the description and sent to the sampler service.
    pub tenant_id: String,
    /// Per callee service overrides.
    pub services: HashMap<String, ServiceSamplerConfig>,
    /// Record spans that lose the fraction draw instead of dropping them, so
    /// the deferred filter can still keep errors and slow spans.
    pub deferred: bool,
    /// Control-plane address serving the dyeing table. No sync when unset.
    pub sampler_server_addr: Option<String>,
    /// Period of the dyeing table sync.
    #[serde(with = "crate::config::duration_ms")]
    pub sync_interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            fraction: 1.0,
            tenant_id: String::new(),
            services: HashMap::new(),
            deferred: false,
            sampler_server_addr: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

#[derive(Clone, Debug)]
struct ServiceBounds {
    default: u64,
    methods: HashMap<String, u64>,
}

/// Probabilistic sampler with service and method overrides and attribute dyeing.
///
/// Decision order for a new span:
///
/// 1. a sampled parent makes the child sampled;
/// 2. a start attribute matching the dyeing table samples the trace and stamps
///    `trace_dyeing=true` into the trace state;
/// 3. a non-empty `trace.force.sample` attribute does the same;
/// 4. otherwise the trace id is compared against the effective fraction of the
///    callee service and method.
#[derive(Clone, Debug)]
pub struct TpsSampler {
    fraction: f64,
    tenant_id: String,
    global: u64,
    services: HashMap<String, ServiceBounds>,
    deferred: bool,
    dyeing: DyeingTable,
    debug: bool,
}

impl TpsSampler {
    /// Compiles `config`. The dyeing table starts empty.
    pub fn new(config: &SamplerConfig) -> Self {
        Self::with_dyeing(config, DyeingTable::default())
    }

    /// Compiles `config` around a shared dyeing table.
    pub fn with_dyeing(config: &SamplerConfig, dyeing: DyeingTable) -> Self {
        let global = fraction_upper_bound(config.fraction);
        let services = config
            .services
            .iter()
            .map(|(service, sc)| {
                let default = sc.fraction.map_or(global, fraction_upper_bound);
                let methods = sc
                    .methods
                    .iter()
                    .map(|(method, f)| (method.clone(), fraction_upper_bound(*f)))
                    .collect();
                (service.clone(), ServiceBounds { default, methods })
            })
            .collect();

        TpsSampler {
            fraction: config.fraction,
            tenant_id: config.tenant_id.clone(),
            global,
            services,
            deferred: config.deferred,
            dyeing,
            debug: std::env::var(DYEING_DEBUG_ENV).is_ok_and(|v| v == "true"),
        }
    }

    /// The dyeing table consulted by this sampler.
    pub fn dyeing(&self) -> &DyeingTable {
        &self.dyeing
    }

    fn upper_bound(&self, attributes: &[KeyValue]) -> u64 {
        let service = find(attributes, semconv::CALLEE_SERVICE);
        let Some(bounds) = service.and_then(|s| self.services.get(s.value.as_str().as_ref()))
        else {
            return self.global;
        };
        find(attributes, semconv::CALLEE_METHOD)
            .and_then(|m| bounds.methods.get(m.value.as_str().as_ref()))
            .copied()
            .unwrap_or(bounds.default)
    }

    fn dyed(parent: Option<&SpanContext>) -> SamplingResult {
        let base = parent
            .map(|sc| sc.trace_state().clone())
            .unwrap_or_default();
        let trace_state = base
            .insert(semconv::TRACE_DYEING, "true")
            .unwrap_or_else(|_| base.clone());
        SamplingResult {
            decision: SamplingDecision::RecordAndSample,
            attributes: Vec::new(),
            trace_state,
        }
    }
}

fn find<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a KeyValue> {
    attributes.iter().find(|kv| kv.key.as_str() == key)
}

impl ShouldSample for TpsSampler {
    fn should_sample(
        &self,
        parent: Option<&SpanContext>,
        trace_id: TraceId,
        name: &str,
        _span_kind: &SpanKind,
        attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let parent_state = || {
            parent
                .map(|sc| sc.trace_state().clone())
                .unwrap_or_else(TraceState::default)
        };

        if parent.is_some_and(|sc| sc.is_sampled()) {
            return SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: Vec::new(),
                trace_state: parent_state(),
            };
        }

        if let Some(kv) = self.dyeing.matches(attributes) {
            if self.debug {
                tps_debug!(
                    name: "TpsSampler.Dyed",
                    span_name = name.to_string(),
                    key = kv.key.as_str().to_string(),
                    value = kv.value.as_str().into_owned()
                );
            }
            return Self::dyed(parent);
        }

        if find(attributes, semconv::FORCE_SAMPLE).is_some_and(|kv| !kv.value.as_str().is_empty()) {
            return Self::dyed(parent);
        }

        let decision = if trace_id_keep(trace_id, self.upper_bound(attributes)) {
            SamplingDecision::RecordAndSample
        } else if self.deferred {
            SamplingDecision::RecordOnly
        } else {
            SamplingDecision::Drop
        };
        SamplingResult {
            decision,
            attributes: Vec::new(),
            trace_state: parent_state(),
        }
    }

    fn description(&self) -> String {
        format!(
            "TpsSampler{{fraction={},tenantID={}}}",
            self.fraction, self.tenant_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{remote_parent, IdGenerator, RandomIdGenerator};
    use opentelemetry::trace::SpanId;

    fn config(fraction: f64) -> SamplerConfig {
        SamplerConfig {
            fraction,
            tenant_id: "tenant".into(),
            ..Default::default()
        }
    }

    fn decide(sampler: &TpsSampler, parent: Option<&SpanContext>, attributes: &[KeyValue]) -> SamplingResult {
        let id = RandomIdGenerator::default().new_trace_id();
        sampler.should_sample(parent, id, "op", &SpanKind::Server, attributes, &[])
    }

    #[test]
    fn sampled_parent_wins_over_zero_fraction() {
        let sampler = TpsSampler::new(&config(0.0));
        let parent = remote_parent(TraceId::from(1_u128), SpanId::from(1_u64), true);
        for _ in 0..100 {
            let result = decide(&sampler, Some(&parent), &[]);
            assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        }
    }

    #[test]
    fn fraction_one_keeps_and_zero_drops() {
        let all = TpsSampler::new(&config(1.0));
        let none = TpsSampler::new(&config(0.0));
        for _ in 0..500 {
            assert_eq!(decide(&all, None, &[]).decision, SamplingDecision::RecordAndSample);
            assert_eq!(decide(&none, None, &[]).decision, SamplingDecision::Drop);
        }
    }

    #[test]
    fn deferred_mode_records_instead_of_dropping() {
        let sampler = TpsSampler::new(&SamplerConfig {
            deferred: true,
            ..config(0.0)
        });
        assert_eq!(decide(&sampler, None, &[]).decision, SamplingDecision::RecordOnly);
    }

    #[test]
    fn dyeing_forces_sample_and_marks_trace_state() {
        let dyeing = DyeingTable::new([("user.id", vec!["42"])]);
        let sampler = TpsSampler::with_dyeing(&config(0.0), dyeing);
        let result = decide(&sampler, None, &[KeyValue::new("user.id", "42")]);
        assert_eq!(result.decision, SamplingDecision::RecordAndSample);
        assert_eq!(result.trace_state.get(semconv::TRACE_DYEING), Some("true"));

        let miss = decide(&sampler, None, &[KeyValue::new("user.id", "41")]);
        assert_eq!(miss.decision, SamplingDecision::Drop);
    }

    #[test]
    fn force_sample_attribute_needs_a_value() {
        let sampler = TpsSampler::new(&config(0.0));
        let forced = decide(&sampler, None, &[KeyValue::new(semconv::FORCE_SAMPLE, "yes")]);
        assert_eq!(forced.decision, SamplingDecision::RecordAndSample);
        assert_eq!(forced.trace_state.get(semconv::TRACE_DYEING), Some("true"));

        let empty = decide(&sampler, None, &[KeyValue::new(semconv::FORCE_SAMPLE, "")]);
        assert_eq!(empty.decision, SamplingDecision::Drop);
    }

    #[test]
    fn service_and_method_overrides() {
        let mut services = HashMap::new();
        services.insert(
            "svc".to_string(),
            ServiceSamplerConfig {
                fraction: Some(1.0),
                methods: HashMap::from([("Cold".to_string(), 0.0)]),
            },
        );
        services.insert("inherit".to_string(), ServiceSamplerConfig::default());
        let sampler = TpsSampler::new(&SamplerConfig {
            services,
            ..config(0.0)
        });

        let attrs = |service: &'static str, method: &'static str| {
            vec![
                KeyValue::new(semconv::CALLEE_SERVICE, service),
                KeyValue::new(semconv::CALLEE_METHOD, method),
            ]
        };
        for _ in 0..200 {
            assert_eq!(
                decide(&sampler, None, &attrs("svc", "Hot")).decision,
                SamplingDecision::RecordAndSample
            );
            assert_eq!(decide(&sampler, None, &attrs("svc", "Cold")).decision, SamplingDecision::Drop);
            assert_eq!(decide(&sampler, None, &attrs("inherit", "Any")).decision, SamplingDecision::Drop);
            assert_eq!(decide(&sampler, None, &attrs("other", "Hot")).decision, SamplingDecision::Drop);
        }
    }

    #[test]
    fn description_is_stable() {
        let sampler = TpsSampler::new(&config(0.25));
        assert_eq!(sampler.description(), "TpsSampler{fraction=0.25,tenantID=tenant}");
        assert_eq!(
            TpsSampler::new(&config(1.0)).description(),
            "TpsSampler{fraction=1,tenantID=tenant}"
        );
    }
}
