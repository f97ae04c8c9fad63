use super::{guard, utf8, Connection, Exporter, ExporterConfig};
use crate::error::{ExportError, ExportResult};
use crate::grpc;
use crate::resource::SharedResource;
use crate::self_metrics::{signal, SelfMetrics};
use crate::trace::{group_spans_by_scope, SpanData};
use crate::tps_debug;
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_client::TraceServiceClient, ExportTraceServiceRequest,
};
use std::fmt;
use std::time::Duration;

/// Sends spans to `TraceService.Export`.
pub struct TraceExporter {
    connection: Connection,
    resource: SharedResource,
}

impl fmt::Debug for TraceExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceExporter")
            .field("connection", &self.connection)
            .finish()
    }
}

impl TraceExporter {
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
        Ok(TraceExporter {
            connection: Connection::new(config, metrics)?,
            resource,
        })
    }
}

impl Exporter for TraceExporter {
    type Item = SpanData;

    async fn start(&self) -> ExportResult {
        self.connection.start()
    }

    async fn export(&self, batch: Vec<SpanData>, timeout: Option<Duration>) -> ExportResult {
        if batch.is_empty() {
            return Ok(());
        }
        let resource = self.resource.load();
        let request = guard::catch(signal::TRACE, self.connection.metrics(), || {
            ExportTraceServiceRequest {
                resource_spans: vec![group_spans_by_scope(&batch, &resource)],
            }
        })?;
        let interceptor = self.connection.interceptor();

        tps_debug!(name: "TraceExporter.ExportStarted", spans = batch.len());
        let result = self
            .connection
            .send(signal::TRACE, timeout, |channel| {
                let mut client = TraceServiceClient::with_interceptor(channel, interceptor.clone());
                if let Some(encoding) = grpc::compression() {
                    client = client.send_compressed(encoding).accept_compressed(encoding);
                }
                let request = request.clone();
                async move { client.export(request).await.map(|_| ()) }
            })
            .await;

        if let Err(err) = &result {
            tps_debug!(name: "TraceExporter.ExportFailed", error = format!("{err}"));
            utf8::diagnose(err, || utf8::spans(&request));
        }
        result
    }

    async fn shutdown(&self) -> ExportResult {
        self.connection.shutdown().await
    }
}
