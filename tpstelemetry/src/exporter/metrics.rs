use super::{guard, Connection, Exporter, ExporterConfig};
use crate::error::{ExportError, ExportResult};
use crate::grpc;
use crate::resource::{Resource, SharedResource};
use crate::self_metrics::{signal, SelfMetrics};
use crate::tps_debug;
use crate::transform::scope;
use opentelemetry_proto::tonic::collector::metrics::v1::{
    metrics_service_client::MetricsServiceClient, ExportMetricsServiceRequest,
};
use opentelemetry_proto::tonic::metrics::v1::{Metric, ResourceMetrics, ScopeMetrics};
use std::fmt;
use std::time::Duration;

pub(crate) const METRIC_SCOPE: &str = "tpstelemetry.metrics";

/// Sends metrics to `MetricsService.Export`.
pub struct MetricExporter {
    connection: Connection,
    resource: SharedResource,
}

impl fmt::Debug for MetricExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricExporter")
            .field("connection", &self.connection)
            .finish()
    }
}

impl MetricExporter {
    /// Creates an exporter counting into the global self-metrics.
    pub fn new(config: ExporterConfig, resource: SharedResource) -> Result<Self, ExportError> {
        Self::with_self_metrics(config, resource, SelfMetrics::global().clone())
    }

    /// Creates an exporter counting into `metrics`.
    pub fn with_self_metrics(
        config: ExporterConfig,
        resource: SharedResource,
        metrics: SelfMetrics,
    ) -> Result<Self, ExportError> {
        Ok(MetricExporter {
            connection: Connection::new(config, metrics)?,
            resource,
        })
    }
}

pub(crate) fn metrics_request(batch: Vec<Metric>, resource: &Resource) -> ExportMetricsServiceRequest {
    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(resource.into()),
            scope_metrics: vec![ScopeMetrics {
                scope: Some(scope(METRIC_SCOPE)),
                metrics: batch,
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        }],
    }
}

impl Exporter for MetricExporter {
    type Item = Metric;

    async fn start(&self) -> ExportResult {
        self.connection.start()
    }

    async fn export(&self, batch: Vec<Metric>, timeout: Option<Duration>) -> ExportResult {
        if batch.is_empty() {
            return Ok(());
        }
        let resource = self.resource.load();
        let request = guard::catch(signal::METRICS, self.connection.metrics(), || {
            metrics_request(batch, &resource)
        })?;
        let interceptor = self.connection.interceptor();

        let result = self
            .connection
            .send(signal::METRICS, timeout, |channel| {
                let mut client = MetricsServiceClient::with_interceptor(channel, interceptor.clone());
                if let Some(encoding) = grpc::compression() {
                    client = client.send_compressed(encoding).accept_compressed(encoding);
                }
                let request = request.clone();
                async move { client.export(request).await.map(|_| ()) }
            })
            .await;

        if let Err(err) = &result {
            tps_debug!(name: "MetricExporter.ExportFailed", error = format!("{err}"));
        }
        result
    }

    async fn shutdown(&self) -> ExportResult {
        self.connection.shutdown().await
    }
}
