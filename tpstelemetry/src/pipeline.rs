//! # Pipeline setup
//!
//! [`Telemetry::init`] assembles every component from a [`Config`]: one
//! exporter per signal behind its batch processor, the sampler and deferred
//! filter in front of the span batch, the log filters in front of the log
//! batch, RPC metrics pushed through the cardinality guard, and the
//! control-plane daemons. [`Telemetry::shutdown`] takes them down in reverse.
use crate::batch::{BatchLogProcessor, BatchMetricProcessor, BatchSpanProcessor};
use crate::codes::CodeMapper;
use crate::config::Config;
use crate::error::{BatchError, BatchResult, InitError, RegistryError};
use crate::exporter::{AsyncLogExporter, LogExporter, MetricExporter, TraceExporter};
use crate::logs::{Logger, TpsLogLayer};
use crate::metrics::{CardinalityGuard, MetricPusher, RpcMetrics};
use crate::registry::{LeaseStore, Registrar, RegistryConfig};
use crate::remote::{self, GrpcOperationSource, OwnersApplier, RemoteConfigurator};
use crate::resource::SharedResource;
use crate::sampler::{DyeingSync, DyeingTable, GrpcSamplerSource, TpsSampler};
use crate::self_metrics::SelfMetrics;
use crate::trace::{DeferredSampleProcessor, SpanProcessor, TraceSwitch, Tracer, TracerProvider};
use crate::{tps_info, tps_warn};
use prometheus::Registry;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

/// The running pipeline.
#[derive(Debug)]
pub struct Telemetry {
    resource: SharedResource,
    metrics: SelfMetrics,
    registry: Registry,
    codes: CodeMapper,
    rpc: RpcMetrics,
    switch: TraceSwitch,
    per_metric_limit: usize,
    total_metric_limit: usize,
    tracer_provider: Option<TracerProvider>,
    logger: Option<Logger>,
    log_processor: Option<Arc<BatchLogProcessor>>,
    metric_processor: Option<Arc<BatchMetricProcessor>>,
    pusher: Option<MetricPusher>,
    remote: Option<RemoteConfigurator>,
    dyeing: Option<DyeingSync>,
    registrar: Option<Registrar>,
}

impl Telemetry {
    /// Builds and starts the pipeline. Must be called within a Tokio runtime.
    pub async fn init(config: Config) -> Result<Self, InitError> {
        Self::init_with_registry(config, Registry::new()).await
    }

    /// Like [`Telemetry::init`], recording RPC metrics and self-metrics on
    /// `registry`.
    pub async fn init_with_registry(config: Config, registry: Registry) -> Result<Self, InitError> {
        Self::init_with_span_processors(config, registry, Vec::new()).await
    }

    /// Like [`Telemetry::init_with_registry`], appending `processors` after the
    /// exporting span processor, e.g. the admin server's tracez processor.
    pub async fn init_with_span_processors(
        config: Config,
        registry: Registry,
        processors: Vec<Box<dyn SpanProcessor>>,
    ) -> Result<Self, InitError> {
        config.validate()?;
        let metrics = SelfMetrics::new(&registry);
        let resource = SharedResource::new(config.resource.to_resource());
        let codes = CodeMapper::new(config.codes.clone());
        let rpc = if config.metrics.with_rpc_type {
            RpcMetrics::with_rpc_type(&registry, codes.clone())?
        } else {
            RpcMetrics::new(&registry, codes.clone())?
        };

        let mut telemetry = Telemetry {
            resource,
            metrics,
            registry,
            codes,
            rpc,
            switch: TraceSwitch::new(config.traces.enabled),
            per_metric_limit: config.metrics.per_metric_limit,
            total_metric_limit: config.metrics.total_metric_limit,
            tracer_provider: None,
            logger: None,
            log_processor: None,
            metric_processor: None,
            pusher: None,
            remote: None,
            dyeing: None,
            registrar: None,
        };

        telemetry.init_traces(&config, processors)?;
        if config.logs.enabled {
            telemetry.init_logs(&config)?;
        }
        if config.metrics.enabled {
            telemetry.init_metrics(&config)?;
        }
        if let Some(addr) = &config.remote.addr {
            let source = GrpcOperationSource::new(addr, &config.remote)?;
            let configurator = RemoteConfigurator::start(source, config.remote.sync_interval);
            configurator.register(telemetry.codes.clone());
            configurator.register(OwnersApplier::new(telemetry.resource.clone()));
            telemetry.remote = Some(configurator);
        }
        if let Some(registry) = &config.registry {
            telemetry.init_registry(registry).await?;
        }

        tps_info!(
            name: "Telemetry.Initialized",
            endpoint = config.exporter.endpoint.as_str(),
            traces = config.traces.enabled,
            logs = config.logs.enabled,
            metrics = config.metrics.enabled,
        );
        Ok(telemetry)
    }

    fn init_traces(
        &mut self,
        config: &Config,
        processors: Vec<Box<dyn SpanProcessor>>,
    ) -> Result<(), InitError> {
        let traces = &config.traces;
        let mut sampler_config = traces.sampler.clone();
        sampler_config.deferred |= traces.deferred.is_enabled();
        if sampler_config.tenant_id.is_empty() {
            sampler_config.tenant_id = config.exporter.tenant_id.clone();
        }

        let dyeing = DyeingTable::default();
        if let Some(addr) = &sampler_config.sampler_server_addr {
            let source = GrpcSamplerSource::new(addr, &sampler_config.tenant_id, config.remote.timeout)?;
            self.dyeing = Some(DyeingSync::start(
                dyeing.clone(),
                source,
                sampler_config.sync_interval,
                remote::debug_enabled(),
            ));
        }

        let exporter = TraceExporter::with_self_metrics(
            config.exporter.clone(),
            self.resource.clone(),
            self.metrics.clone(),
        )?;
        let batch =
            BatchSpanProcessor::with_self_metrics(exporter, traces.batch.clone(), self.metrics.clone());
        let builder = TracerProvider::builder()
            .with_span_processor(DeferredSampleProcessor::new(traces.deferred.clone(), batch))
            .with_sampler(TpsSampler::with_dyeing(&sampler_config, dyeing))
            .with_resource((*self.resource.load()).clone())
            .with_switch(self.switch.clone());
        self.tracer_provider = Some(
            processors
                .into_iter()
                .fold(builder, |builder, processor| {
                    builder.with_boxed_span_processor(processor)
                })
                .build(),
        );
        Ok(())
    }

    fn init_logs(&mut self, config: &Config) -> Result<(), InitError> {
        let logs = &config.logs;
        let exporter = LogExporter::with_self_metrics(
            config.exporter.clone(),
            self.resource.clone(),
            self.metrics.clone(),
        )?;
        let processor = match &logs.async_export {
            Some(async_config) => BatchLogProcessor::with_self_metrics(
                AsyncLogExporter::with_self_metrics(exporter, async_config.clone(), self.metrics.clone()),
                logs.batch.clone(),
                self.metrics.clone(),
            ),
            None => BatchLogProcessor::with_self_metrics(exporter, logs.batch.clone(), self.metrics.clone()),
        };
        let processor = Arc::new(processor);
        self.logger = Some(Logger::with_self_metrics(
            logs,
            processor.clone(),
            self.metrics.clone(),
        ));
        self.log_processor = Some(processor);
        Ok(())
    }

    fn init_metrics(&mut self, config: &Config) -> Result<(), InitError> {
        let exporter = MetricExporter::with_self_metrics(
            config.exporter.clone(),
            self.resource.clone(),
            self.metrics.clone(),
        )?;
        let processor = Arc::new(BatchMetricProcessor::with_self_metrics(
            exporter,
            config.metrics.batch.clone(),
            self.metrics.clone(),
        ));
        self.pusher = Some(MetricPusher::start(
            self.cardinality_guard(),
            processor.clone(),
            config.metrics.push_interval,
        ));
        self.metric_processor = Some(processor);
        Ok(())
    }

    #[cfg(feature = "etcd")]
    async fn init_registry(&mut self, config: &RegistryConfig) -> Result<(), InitError> {
        let store = crate::registry::EtcdLeaseStore::connect(config).await?;
        self.register_with(store, config)?;
        Ok(())
    }

    #[cfg(not(feature = "etcd"))]
    async fn init_registry(&mut self, config: &RegistryConfig) -> Result<(), InitError> {
        tps_warn!(
            name: "Telemetry.RegistryUnavailable",
            key = config.key(),
            reason = "built without the etcd feature",
        );
        Ok(())
    }

    /// Registers the metrics endpoint on `store`, replacing an earlier
    /// registration.
    pub fn register_with<S: LeaseStore>(
        &mut self,
        store: S,
        config: &RegistryConfig,
    ) -> Result<(), RegistryError> {
        self.registrar = Some(Registrar::start(store, config)?);
        Ok(())
    }

    /// Provider of the trace pipeline.
    pub fn tracer_provider(&self) -> Option<&TracerProvider> {
        self.tracer_provider.as_ref()
    }

    /// Tracer for the instrumentation scope `name`.
    pub fn tracer<T: Into<Cow<'static, str>>>(&self, name: T) -> Option<Tracer> {
        self.tracer_provider.as_ref().map(|provider| provider.tracer(name))
    }

    /// Logger of the log pipeline, `None` when logs are disabled.
    pub fn logger(&self) -> Option<&Logger> {
        self.logger.as_ref()
    }

    /// A `tracing` layer feeding the log pipeline.
    pub fn log_layer(&self) -> Option<TpsLogLayer> {
        self.logger.clone().map(TpsLogLayer::new)
    }

    /// RPC metrics reporter.
    pub fn rpc_metrics(&self) -> &RpcMetrics {
        &self.rpc
    }

    /// Registry holding RPC metrics and self-metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A new guard over [`Telemetry::registry`] with the configured limits.
    pub fn cardinality_guard(&self) -> CardinalityGuard {
        CardinalityGuard::new(
            self.registry.clone(),
            self.per_metric_limit,
            self.total_metric_limit,
        )
        .with_rpc_metrics(self.rpc.clone())
        .with_self_metrics(self.metrics.clone())
    }

    /// Process-wide trace toggle.
    pub fn trace_switch(&self) -> &TraceSwitch {
        &self.switch
    }

    /// Resource stamped on exports.
    pub fn resource(&self) -> &SharedResource {
        &self.resource
    }

    /// Code classifier shared with the RPC metrics.
    pub fn code_mapper(&self) -> &CodeMapper {
        &self.codes
    }

    /// Pipeline self-metrics.
    pub fn self_metrics(&self) -> &SelfMetrics {
        &self.metrics
    }

    /// Stops the daemons, then drains and shuts down every signal, each with
    /// `timeout`. Returns the first error. A second call does nothing.
    pub async fn shutdown(&mut self, timeout: Duration) -> BatchResult {
        if let Some(remote) = self.remote.take() {
            remote.shutdown().await;
        }
        if let Some(mut dyeing) = self.dyeing.take() {
            dyeing.shutdown().await;
        }
        if let Some(mut registrar) = self.registrar.take() {
            if let Err(err) = registrar.stop().await {
                tps_warn!(name: "Telemetry.DeregisterFailed", error = format!("{err}"));
            }
        }
        if let Some(mut pusher) = self.pusher.take() {
            pusher.shutdown().await;
        }

        let mut first_error: Option<BatchError> = None;
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown(timeout).await {
                first_error.get_or_insert(err);
            }
        }
        self.logger = None;
        if let Some(processor) = self.log_processor.take() {
            if let Err(err) = processor.shutdown(timeout).await {
                first_error.get_or_insert(err);
            }
        }
        if let Some(processor) = self.metric_processor.take() {
            if let Err(err) = processor.shutdown(timeout).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{Level, Record};
    use crate::metrics::{RpcReport, Side};

    fn config() -> Config {
        Config::from_yaml(
            r#"
exporter:
  endpoint: http://127.0.0.1:1
  tenant_id: acme
resource:
  service_name: shop.checkout
metrics:
  push_interval: 3600000
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn init_wires_every_signal() {
        let mut telemetry = Telemetry::init(config()).await.unwrap();
        assert!(telemetry.tracer("test").is_some());
        assert!(telemetry.logger().is_some());
        assert!(telemetry.log_layer().is_some());
        assert!(telemetry.trace_switch().is_enabled());
        assert_eq!(
            telemetry.resource().load().get(crate::semconv::SERVICE_NAME).map(|v| v.as_str().into_owned()),
            Some("shop.checkout".to_string())
        );

        telemetry
            .rpc_metrics()
            .report(Side::Server, &RpcReport::default());
        let names: Vec<_> = telemetry
            .cardinality_guard()
            .gather()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "rpc_server_handled_total"));

        telemetry
            .logger()
            .unwrap()
            .log(Record::new(Level::Error, "boom"));
        assert_eq!(telemetry.self_metrics().log_level_count("error"), 1);

        telemetry.shutdown(Duration::from_millis(200)).await.ok();
        assert!(telemetry.tracer("after").is_none());
        telemetry.shutdown(Duration::from_millis(200)).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_signals_are_not_built() {
        let mut config = config();
        config.logs.enabled = false;
        config.metrics.enabled = false;
        config.traces.enabled = false;
        let mut telemetry = Telemetry::init(config).await.unwrap();
        assert!(telemetry.logger().is_none());
        assert!(!telemetry.trace_switch().is_enabled());
        telemetry.shutdown(Duration::from_millis(200)).await.ok();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = config();
        config.traces.sampler.fraction = -1.0;
        assert!(matches!(
            Telemetry::init(config).await,
            Err(InitError::Config(_))
        ));
    }
}
