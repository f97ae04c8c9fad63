//! # Remote configuration
//!
//! A [`RemoteConfigurator`] polls `OperationService.GetOperation` and fans the
//! returned [`Operation`] out to registered [`Applier`]s: the code mapper
//! rebuilds its table, the [`OwnersApplier`] stamps the server owners on the
//! exported resource. A failed poll keeps whatever was applied last.
//!
//! Debug logging of every poll is enabled when `OTEL_TRACE` contains `remote`.
use crate::error::RemoteError;
use crate::grpc::{self, TenantInterceptor};
use crate::resource::SharedResource;
use crate::runtime::{self, BackgroundTask};
use crate::semconv;
use crate::{tps_debug, tps_warn};
use arc_swap::ArcSwapOption;
use futures_util::future::BoxFuture;
use opentelemetry::KeyValue;
use serde::Deserialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tpstelemetry_proto::tonic::control::v1::operation_service_client::OperationServiceClient;
use tpstelemetry_proto::tonic::control::v1::{GetOperationRequest, Operation};

/// Environment variable enabling debug logs; the value must contain `remote`.
pub const OTEL_TRACE: &str = "OTEL_TRACE";

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer of control-plane operations.
pub trait Applier: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Applies `operation`. Errors are logged; other appliers still run.
    fn apply(&self, operation: &Operation) -> Result<(), RemoteError>;
}

/// Provides control-plane operations.
pub trait OperationSource: Send + Sync + fmt::Debug + 'static {
    /// Fetches the current operation.
    fn fetch(&self) -> BoxFuture<'_, Result<Operation, RemoteError>>;
}

/// Configuration of the remote configurator.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Control-plane address, polling is off when unset.
    pub addr: Option<String>,
    /// Tenant, sent in the request and as the tenant header.
    pub tenant_id: String,
    /// Application name.
    pub app: String,
    /// Server name.
    pub server: String,
    /// Polling period.
    #[serde(with = "crate::config::duration_ms")]
    pub sync_interval: Duration,
    /// Per request timeout.
    #[serde(with = "crate::config::duration_ms")]
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            addr: None,
            tenant_id: String::new(),
            app: String::new(),
            server: String::new(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Fetches operations from `OperationService.GetOperation`.
#[derive(Clone, Debug)]
pub struct GrpcOperationSource {
    client: OperationServiceClient<InterceptedService<Channel, TenantInterceptor>>,
    request: GetOperationRequest,
    timeout: Duration,
}

impl GrpcOperationSource {
    /// Creates a source dialing `addr` lazily. Must be called within a Tokio runtime.
    pub fn new(addr: &str, config: &RemoteConfig) -> Result<Self, RemoteError> {
        let endpoint = grpc::endpoint(addr, config.timeout)
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        let client = OperationServiceClient::with_interceptor(
            grpc::lazy_channel(&endpoint),
            TenantInterceptor::new(&config.tenant_id),
        );
        Ok(GrpcOperationSource {
            client,
            request: GetOperationRequest {
                tenant: config.tenant_id.clone(),
                app: config.app.clone(),
                server: config.server.clone(),
            },
            timeout: config.timeout,
        })
    }
}

impl OperationSource for GrpcOperationSource {
    fn fetch(&self) -> BoxFuture<'_, Result<Operation, RemoteError>> {
        let mut client = self.client.clone();
        let mut request = tonic::Request::new(self.request.clone());
        request.set_timeout(self.timeout);
        Box::pin(async move {
            let response = client.get_operation(request).await?.into_inner();
            if response.code != 0 {
                return Err(RemoteError::Rejected {
                    code: response.code,
                    msg: response.msg,
                });
            }
            response.operation.ok_or_else(|| RemoteError::Rejected {
                code: response.code,
                msg: "response carries no operation".to_string(),
            })
        })
    }
}

struct Shared {
    appliers: Mutex<Vec<Arc<dyn Applier>>>,
    last: ArcSwapOption<Operation>,
    debug: bool,
}

impl Shared {
    fn apply_all(&self, operation: &Operation) {
        let appliers = match self.appliers.lock() {
            Ok(appliers) => appliers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for applier in appliers.iter() {
            apply_one(applier.as_ref(), operation);
        }
    }
}

fn apply_one(applier: &dyn Applier, operation: &Operation) {
    if let Err(err) = applier.apply(operation) {
        tps_warn!(
            name: "RemoteConfigurator.ApplyFailed",
            applier = applier.name().to_string(),
            error = format!("{err}")
        );
    }
}

/// Polls the control plane and multicasts operations to appliers.
///
/// Clones share the appliers and the cached operation.
#[derive(Clone)]
pub struct RemoteConfigurator {
    shared: Arc<Shared>,
    stop: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<BackgroundTask>>>,
}

impl fmt::Debug for RemoteConfigurator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfigurator")
            .field("has_operation", &self.shared.last.load().is_some())
            .finish()
    }
}

impl RemoteConfigurator {
    /// Creates a configurator that only applies operations pushed through
    /// [`RemoteConfigurator::sync_once`].
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        RemoteConfigurator {
            shared: Arc::new(Shared {
                appliers: Mutex::new(Vec::new()),
                last: ArcSwapOption::empty(),
                debug: debug_enabled(),
            }),
            stop: Arc::new(stop),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a configurator polling `source` every `interval`, starting now.
    pub fn start<S: OperationSource>(source: S, interval: Duration) -> Self {
        let configurator = RemoteConfigurator::new();
        let mut stopped = configurator.stop.subscribe();
        let shared = configurator.shared.clone();
        let task = runtime::spawn("tps-remote-config", async move {
            loop {
                sync(&shared, &source).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => break,
                }
            }
        });
        if let Ok(mut slot) = configurator.task.lock() {
            *slot = Some(task);
        }
        configurator
    }

    /// Registers `applier`. If an operation was already received it is applied
    /// immediately.
    pub fn register<A: Applier>(&self, applier: A) {
        let applier: Arc<dyn Applier> = Arc::new(applier);
        let mut appliers = match self.shared.appliers.lock() {
            Ok(appliers) => appliers,
            Err(poisoned) => poisoned.into_inner(),
        };
        appliers.push(applier.clone());
        if let Some(operation) = self.shared.last.load_full() {
            apply_one(applier.as_ref(), &operation);
        }
    }

    /// The last operation received.
    pub fn last_operation(&self) -> Option<Arc<Operation>> {
        self.shared.last.load_full()
    }

    /// Fetches once from `source` and applies the result.
    pub async fn sync_once<S: OperationSource>(&self, source: &S) {
        sync(&self.shared, source).await
    }

    /// Stops polling and waits for the daemon to exit.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let task = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            let _ = task.join().await;
        }
    }
}

impl Default for RemoteConfigurator {
    fn default() -> Self {
        RemoteConfigurator::new()
    }
}

async fn sync<S: OperationSource + ?Sized>(shared: &Shared, source: &S) {
    match source.fetch().await {
        Ok(operation) => {
            if shared.debug {
                tps_debug!(name: "RemoteConfigurator.Fetched", operation = format!("{operation:?}"));
            }
            let operation = Arc::new(operation);
            shared.last.store(Some(operation.clone()));
            shared.apply_all(&operation);
        }
        Err(err) => {
            if shared.debug {
                tps_warn!(name: "RemoteConfigurator.FetchFailed", error = format!("{err}"));
            }
        }
    }
}

pub(crate) fn debug_enabled() -> bool {
    std::env::var(OTEL_TRACE).is_ok_and(|v| v.contains("remote"))
}

/// Stamps the owners of the server on the exported resource as `server.owner`,
/// a comma separated list.
#[derive(Clone, Debug)]
pub struct OwnersApplier {
    resource: SharedResource,
}

impl OwnersApplier {
    /// Applies owners to `resource`.
    pub fn new(resource: SharedResource) -> Self {
        OwnersApplier { resource }
    }
}

impl Applier for OwnersApplier {
    fn name(&self) -> &str {
        "owners"
    }

    fn apply(&self, operation: &Operation) -> Result<(), RemoteError> {
        if operation.owners.is_empty() {
            return Ok(());
        }
        let owners = operation
            .owners
            .iter()
            .map(|owner| owner.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.resource
            .update([KeyValue::new(semconv::SERVER_OWNER, owners)]);
        Ok(())
    }
}
