use super::dyeing::collect;
use super::DyeingTable;
use crate::error::RemoteError;
use crate::grpc::{self, TenantInterceptor};
use crate::runtime::{self, BackgroundTask};
use crate::{tps_debug, tps_warn};
use futures_util::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tpstelemetry_proto::tonic::control::v1::sampler_service_client::SamplerServiceClient;
use tpstelemetry_proto::tonic::control::v1::GetSamplerRequest;

/// Provides the dyeing table.
pub trait SamplerSource: Send + Sync + fmt::Debug + 'static {
    /// Fetches the current table.
    fn fetch(&self) -> BoxFuture<'_, Result<HashMap<String, HashSet<String>>, RemoteError>>;
}

/// Fetches the dyeing table from `SamplerService.GetSampler`.
#[derive(Clone, Debug)]
pub struct GrpcSamplerSource {
    client: SamplerServiceClient<InterceptedService<Channel, TenantInterceptor>>,
    tenant_id: String,
    timeout: Duration,
}

impl GrpcSamplerSource {
    /// Creates a source dialing `addr` lazily. Must be called within a Tokio runtime.
    pub fn new(addr: &str, tenant_id: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let endpoint =
            grpc::endpoint(addr, timeout).map_err(|err| RemoteError::Transport(err.to_string()))?;
        let client = SamplerServiceClient::with_interceptor(
            grpc::lazy_channel(&endpoint),
            TenantInterceptor::new(tenant_id),
        );
        Ok(GrpcSamplerSource {
            client,
            tenant_id: tenant_id.to_string(),
            timeout,
        })
    }
}

impl SamplerSource for GrpcSamplerSource {
    fn fetch(&self) -> BoxFuture<'_, Result<HashMap<String, HashSet<String>>, RemoteError>> {
        let mut client = self.client.clone();
        let mut request = tonic::Request::new(GetSamplerRequest {
            tenant: self.tenant_id.clone(),
        });
        request.set_timeout(self.timeout);
        Box::pin(async move {
            let response = client.get_sampler(request).await?.into_inner();
            Ok(collect(
                response
                    .attributes
                    .into_iter()
                    .map(|attribute| (attribute.key, attribute.values)),
            ))
        })
    }
}

/// Daemon keeping a [`DyeingTable`] in sync with a [`SamplerSource`].
///
/// Syncs once immediately and then every `interval`. A failed fetch keeps the
/// previous table.
#[derive(Debug)]
pub struct DyeingSync {
    stop: watch::Sender<bool>,
    task: Option<BackgroundTask>,
}

impl DyeingSync {
    /// Starts syncing `table` from `source`.
    pub fn start<S: SamplerSource>(
        table: DyeingTable,
        source: S,
        interval: Duration,
        debug: bool,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let source = Arc::new(source);
        let task = runtime::spawn("tps-dyeing-sync", async move {
            loop {
                match source.fetch().await {
                    Ok(entries) => {
                        if debug {
                            tps_debug!(name: "DyeingSync.Updated", keys = entries.len());
                        }
                        table.set(entries);
                    }
                    Err(err) => {
                        if debug {
                            tps_warn!(name: "DyeingSync.FetchFailed", error = format!("{err}"));
                        }
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => break,
                }
            }
        });
        DyeingSync {
            stop,
            task: Some(task),
        }
    }

    /// Stops the daemon and waits for it to exit.
    pub async fn shutdown(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.join().await;
        }
    }
}

impl Drop for DyeingSync {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
