//! Error types surfaced by the pipeline.
//!
//! Instrumented callers (`start`, `log`, `report`) never see these; they are
//! returned from lifecycle calls (`start`, `export`, `force_flush`, `shutdown`)
//! and otherwise end up in internal logs and self-metrics.
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the exporters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// `start` was called on an exporter that is already running.
    #[error("already started")]
    AlreadyStarted,

    /// `export` was called before `start`.
    #[error("not started")]
    NotStarted,

    /// The connection is marked broken; the reconnect loop has not restored it yet.
    #[error("disconnected")]
    Disconnected,

    /// The exporter has been shut down.
    #[error("stopped")]
    Stopped,

    /// The caller abandoned the operation.
    #[error("context canceled")]
    Cancelled,

    /// The caller's deadline fired before the export finished.
    #[error("context deadline exceeded after {0:?}")]
    Timeout(Duration),

    /// The collector rejected the request.
    #[error("rpc error: code = {:?} desc = {}", .0.code(), .0.message())]
    Status(Box<tonic::Status>),

    /// Dialing the collector failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The configured endpoint could not be parsed.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        /// Endpoint as configured.
        endpoint: String,
        /// Parser message.
        reason: String,
    },

    /// Serializing or sending the request panicked; the panic was recovered.
    #[error("recovered panic during export: {0}")]
    Panic(String),

    /// Retries were exhausted, wraps the last error seen.
    #[error("max retry time elapsed: {0}")]
    RetryElapsed(Box<ExportError>),
}

impl From<tonic::Status> for ExportError {
    fn from(status: tonic::Status) -> Self {
        ExportError::Status(Box::new(status))
    }
}

impl ExportError {
    /// Returns the gRPC status behind this error, looking through retry wrapping.
    pub fn status(&self) -> Option<&tonic::Status> {
        match self {
            ExportError::Status(status) => Some(status.as_ref()),
            ExportError::RetryElapsed(inner) => inner.status(),
            _ => None,
        }
    }

    /// Whether the error says the underlying connection is unusable and the
    /// reconnect loop should take over.
    pub fn is_transport(&self) -> bool {
        match self {
            ExportError::Transport(_) => true,
            ExportError::Status(status) => matches!(
                status.code(),
                tonic::Code::Unavailable | tonic::Code::Unknown
            ),
            ExportError::RetryElapsed(inner) => inner.is_transport(),
            _ => false,
        }
    }
}

/// Result of an export.
pub type ExportResult = Result<(), ExportError>;

/// Errors returned by batch processors on flush and shutdown.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BatchError {
    /// The caller's deadline fired while waiting for the worker.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The processor was already shut down.
    #[error("batch processor already shut down")]
    AlreadyShutdown,

    /// The worker task is gone.
    #[error("batch worker is not running: {0}")]
    WorkerGone(String),

    /// Shutting the exporter down failed.
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Result of a flush or shutdown.
pub type BatchResult = Result<(), BatchError>;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML document is malformed.
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value is out of range or inconsistent.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Errors from the control plane and remote appliers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RemoteError {
    /// The control-plane call failed.
    #[error("control plane request failed: {0}")]
    Status(Box<tonic::Status>),

    /// The control-plane endpoint could not be dialed.
    #[error("control plane transport error: {0}")]
    Transport(String),

    /// The control plane answered with a non-zero business code.
    #[error("control plane returned code {code}: {msg}")]
    Rejected {
        /// Response code.
        code: i32,
        /// Response message.
        msg: String,
    },

    /// An applier refused the operation.
    #[error("applier failed: {0}")]
    Apply(String),
}

impl From<tonic::Status> for RemoteError {
    fn from(status: tonic::Status) -> Self {
        RemoteError::Status(Box::new(status))
    }
}

impl From<tonic::transport::Error> for RemoteError {
    fn from(err: tonic::transport::Error) -> Self {
        RemoteError::Transport(err.to_string())
    }
}

/// Errors from the service registry client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    /// Inline TLS material could not be parsed.
    #[error("invalid {what} PEM: {reason}")]
    InvalidPem {
        /// Which item, `ca`, `cert` or `key`.
        what: &'static str,
        /// Parser message.
        reason: String,
    },

    /// The key/value store rejected a request or could not be reached.
    #[error("registry store error: {0}")]
    Store(String),

    /// The lease ran out before it could be refreshed.
    #[error("lease {0} expired")]
    LeaseExpired(i64),

    /// Encoding the registration value failed.
    #[error("failed to encode registration: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised while assembling the pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InitError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An exporter could not be created.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// A control-plane client could not be created.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The service registry could not be reached.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Registering the RPC metrics failed.
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_messages_match_wire_contract() {
        assert_eq!(ExportError::AlreadyStarted.to_string(), "already started");
        assert_eq!(ExportError::NotStarted.to_string(), "not started");
        assert_eq!(ExportError::Disconnected.to_string(), "disconnected");
        assert_eq!(ExportError::Stopped.to_string(), "stopped");
        assert_eq!(ExportError::Cancelled.to_string(), "context canceled");
    }

    #[test]
    fn status_is_found_through_retry_wrapping() {
        let err = ExportError::RetryElapsed(Box::new(ExportError::from(
            tonic::Status::unavailable("down"),
        )));
        assert_eq!(err.status().map(|s| s.code()), Some(tonic::Code::Unavailable));
        assert!(err.is_transport());
        assert!(!ExportError::Stopped.is_transport());
    }
}
