use super::{guard, utf8, Connection, Exporter, ExporterConfig};
use crate::error::{ExportError, ExportResult};
use crate::grpc;
use crate::resource::{Resource, SharedResource};
use crate::self_metrics::{signal, SelfMetrics};
use crate::tps_debug;
use crate::transform::scope;
use opentelemetry_proto::tonic::collector::logs::v1::{
    logs_service_client::LogsServiceClient, ExportLogsServiceRequest,
};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use std::fmt;
use std::time::Duration;

pub(crate) const LOG_SCOPE: &str = "tpstelemetry.logs";

/// Sends log records to `LogsService.Export`.
pub struct LogExporter {
    connection: Connection,
    resource: SharedResource,
}

impl fmt::Debug for LogExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogExporter")
            .field("connection", &self.connection)
            .finish()
    }
}

impl LogExporter {
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
        Ok(LogExporter {
            connection: Connection::new(config, metrics)?,
            resource,
        })
    }
}

pub(crate) fn logs_request(batch: Vec<LogRecord>, resource: &Resource) -> ExportLogsServiceRequest {
    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(resource.into()),
            scope_logs: vec![ScopeLogs {
                scope: Some(scope(LOG_SCOPE)),
                log_records: batch,
                schema_url: String::new(),
            }],
            schema_url: String::new(),
        }],
    }
}

impl Exporter for LogExporter {
    type Item = LogRecord;

    async fn start(&self) -> ExportResult {
        self.connection.start()
    }

    async fn export(&self, batch: Vec<LogRecord>, timeout: Option<Duration>) -> ExportResult {
        if batch.is_empty() {
            return Ok(());
        }
        let resource = self.resource.load();
        let records = batch.len();
        let request = guard::catch(signal::LOGS, self.connection.metrics(), || {
            logs_request(batch, &resource)
        })?;
        let interceptor = self.connection.interceptor();

        tps_debug!(name: "LogExporter.ExportStarted", records = records);
        let result = self
            .connection
            .send(signal::LOGS, timeout, |channel| {
                let mut client = LogsServiceClient::with_interceptor(channel, interceptor.clone());
                if let Some(encoding) = grpc::compression() {
                    client = client.send_compressed(encoding).accept_compressed(encoding);
                }
                let request = request.clone();
                async move { client.export(request).await.map(|_| ()) }
            })
            .await;

        if let Err(err) = &result {
            tps_debug!(name: "LogExporter.ExportFailed", error = format!("{err}"));
            utf8::diagnose(err, || utf8::logs(&request));
        }
        result
    }

    async fn shutdown(&self) -> ExportResult {
        self.connection.shutdown().await
    }
}
