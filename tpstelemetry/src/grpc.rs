//! gRPC channel plumbing shared by the exporters and the control-plane clients.
use crate::error::ExportError;
use crate::semconv::TENANT_HEADER;
use crate::tps_debug;
use std::time::Duration;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{AsciiMetadataValue, MetadataValue};
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};

/// Default collector endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:4317";

/// Attaches the tenant header to every outgoing request.
#[derive(Clone, Debug, Default)]
pub struct TenantInterceptor {
    tenant: Option<AsciiMetadataValue>,
}

impl TenantInterceptor {
    /// Interceptor for `tenant`. An empty or non-ASCII tenant sends no header.
    pub fn new(tenant: &str) -> Self {
        let tenant = if tenant.is_empty() {
            None
        } else {
            MetadataValue::try_from(tenant).ok()
        };
        TenantInterceptor { tenant }
    }
}

impl Interceptor for TenantInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        if let Some(tenant) = &self.tenant {
            request
                .metadata_mut()
                .insert(TENANT_HEADER, tenant.clone());
        }
        Ok(request)
    }
}

/// Parses `endpoint` into a tonic endpoint. `http://` dials plaintext,
/// `https://` dials TLS; any other scheme is rejected.
pub fn endpoint(endpoint: &str, timeout: Duration) -> Result<Endpoint, ExportError> {
    let invalid = |reason: String| ExportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    let tls = if endpoint.starts_with("https://") {
        true
    } else if endpoint.starts_with("http://") {
        false
    } else {
        return Err(invalid("scheme must be http:// or https://".to_string()));
    };

    let parsed = Channel::from_shared(endpoint.to_string())
        .map_err(|err| invalid(err.to_string()))?
        .timeout(timeout)
        .connect_timeout(timeout);

    if tls {
        tls_endpoint(parsed).map_err(invalid)
    } else {
        Ok(parsed)
    }
}

#[cfg(feature = "tls")]
fn tls_endpoint(endpoint: Endpoint) -> Result<Endpoint, String> {
    endpoint
        .tls_config(tonic::transport::ClientTlsConfig::new().with_native_roots())
        .map_err(|err| err.to_string())
}

#[cfg(not(feature = "tls"))]
fn tls_endpoint(_endpoint: Endpoint) -> Result<Endpoint, String> {
    Err("https endpoints need the `tls` feature".to_string())
}

/// A lazily connected channel to `endpoint`. Must be called within a Tokio runtime.
pub fn lazy_channel(endpoint: &Endpoint) -> Channel {
    tps_debug!(name: "Grpc.ChannelBuilt", endpoint = endpoint.uri().to_string());
    endpoint.connect_lazy()
}

/// Request compression, gzip unless the `gzip` feature is off.
pub fn compression() -> Option<CompressionEncoding> {
    #[cfg(feature = "gzip")]
    {
        Some(CompressionEncoding::Gzip)
    }
    #[cfg(not(feature = "gzip"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_header_is_attached() {
        let mut interceptor = TenantInterceptor::new("tenant-a");
        let request = interceptor.call(tonic::Request::new(())).unwrap();
        assert_eq!(
            request.metadata().get(TENANT_HEADER).unwrap().to_str().unwrap(),
            "tenant-a"
        );

        let mut empty = TenantInterceptor::new("");
        let request = empty.call(tonic::Request::new(())).unwrap();
        assert!(request.metadata().get(TENANT_HEADER).is_none());
    }

    #[test]
    fn endpoint_scheme_is_checked() {
        assert!(endpoint("http://localhost:4317", Duration::from_secs(1)).is_ok());
        let err = endpoint("localhost:4317", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ExportError::InvalidEndpoint { .. }));
    }
}
