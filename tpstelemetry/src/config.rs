//! # Configuration
//!
//! [`Config`] gathers the settings of every pipeline component. It is usually
//! read from YAML:
//!
//! ```yaml
//! exporter:
//!   endpoint: http://collector:4317
//!   tenant_id: acme
//! resource:
//!   service_name: shop.checkout
//! traces:
//!   sampler:
//!     fraction: 0.1
//!   deferred:
//!     sample_error: true
//! logs:
//!   level: warn
//! ```
//!
//! Durations are written in milliseconds. The `OTEL_*` variables of the
//! OpenTelemetry SDK override the file when [`Config::with_env_overrides`]
//! is applied.
use crate::batch::{BatchConfig, BatchEnv};
use crate::codes::CodeEntry;
use crate::error::ConfigError;
use crate::exporter::ExporterConfig;
use crate::logs::LogConfig;
use crate::metrics::MetricsConfig;
use crate::registry::RegistryConfig;
use crate::remote::RemoteConfig;
use crate::resource::Resource;
use crate::sampler::SamplerConfig;
use crate::semconv;
use crate::trace::DeferredSampleConfig;
use opentelemetry::KeyValue;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Overrides [`ResourceConfig::service_name`].
pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";

/// Serde adapter reading a [`std::time::Duration`] from whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Attributes describing this process.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    /// Tenant the telemetry belongs to.
    pub tenant_id: String,
    /// `service.name`.
    pub service_name: String,
    /// `service.namespace`, e.g. `Production`.
    pub namespace: String,
    /// Environment name.
    pub env_name: String,
    /// `service.instance.id`, usually the host address.
    pub instance: String,
    /// Set name for set-based routing.
    pub set_name: String,
    /// Extra attributes, added after the named ones.
    pub attributes: BTreeMap<String, String>,
}

impl ResourceConfig {
    /// Builds the resource, skipping empty values.
    pub fn to_resource(&self) -> Resource {
        let named = [
            (semconv::TENANT_ID, &self.tenant_id),
            (semconv::SERVICE_NAME, &self.service_name),
            (semconv::SERVICE_NAMESPACE, &self.namespace),
            (semconv::ENV_NAME, &self.env_name),
            (semconv::SERVICE_INSTANCE, &self.instance),
            (semconv::SET_NAME, &self.set_name),
        ];
        Resource::new(
            named
                .into_iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| KeyValue::new(key, value.clone()))
                .chain(
                    self.attributes
                        .iter()
                        .map(|(key, value)| KeyValue::new(key.clone(), value.clone())),
                ),
        )
    }
}

/// Trace pipeline settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TracesConfig {
    /// Whether spans are recorded and exported at all.
    pub enabled: bool,
    /// Head sampling.
    pub sampler: SamplerConfig,
    /// Rules keeping unsampled spans.
    pub deferred: DeferredSampleConfig,
    /// Batching of finished spans.
    pub batch: BatchConfig,
}

impl Default for TracesConfig {
    fn default() -> Self {
        TracesConfig {
            enabled: true,
            sampler: SamplerConfig::default(),
            deferred: DeferredSampleConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

/// Settings of the whole pipeline.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Collector connection shared by the three exporters.
    pub exporter: ExporterConfig,
    /// Process attributes.
    pub resource: ResourceConfig,
    /// Trace pipeline.
    pub traces: TracesConfig,
    /// Log pipeline.
    pub logs: LogConfig,
    /// Metric pipeline.
    pub metrics: MetricsConfig,
    /// Control-plane polling.
    pub remote: RemoteConfig,
    /// Local code classifications. Remote entries take precedence over them.
    pub codes: Vec<CodeEntry>,
    /// Registration of the metrics endpoint, off when unset.
    pub registry: Option<RegistryConfig>,
}

impl Config {
    /// Parses and validates a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Applies the `OTEL_*` environment variables on top of `self`:
    ///
    /// * `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_EXPORTER_OTLP_TIMEOUT`
    /// * `OTEL_BSP_*` for the span batch, `OTEL_BLRP_*` for the log batch
    /// * `OTEL_SERVICE_NAME`
    pub fn with_env_overrides(mut self) -> Self {
        self.exporter = self.exporter.with_env_overrides();
        self.traces.batch = self.traces.batch.with_env_overrides(BatchEnv::SPANS);
        self.logs.batch = self.logs.batch.with_env_overrides(BatchEnv::LOGS);
        if let Ok(name) = std::env::var(OTEL_SERVICE_NAME) {
            if !name.is_empty() {
                self.resource.service_name = name;
            }
        }
        self
    }

    /// Checks values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("traces.sampler.fraction", self.traces.sampler.fraction)?;
        for service in self.traces.sampler.services.values() {
            if let Some(fraction) = service.fraction {
                check_fraction("traces.sampler.services.fraction", fraction)?;
            }
            for fraction in service.methods.values() {
                check_fraction("traces.sampler.services.methods", *fraction)?;
            }
        }
        if self.exporter.endpoint.is_empty() {
            return Err(ConfigError::Invalid {
                field: "exporter.endpoint",
                reason: "must not be empty".into(),
            });
        }
        if self.metrics.enabled && self.metrics.push_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "metrics.push_interval",
                reason: "must be positive".into(),
            });
        }
        if let Some(registry) = &self.registry {
            if registry.ttl.as_secs() == 0 {
                return Err(ConfigError::Invalid {
                    field: "registry.ttl",
                    reason: "must be at least one second".into(),
                });
            }
        }
        Ok(())
    }
}

fn check_fraction(field: &'static str, fraction: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&fraction) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{fraction} is outside [0, 1]"),
        })
    }
}
