use super::{LeaseStore, RegistryConfig, TlsMaterial};
use crate::error::RegistryError;
use etcd_client::{
    Certificate, Client, ConnectOptions, Identity, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    TlsOptions,
};
use futures_util::future::BoxFuture;
use std::fmt;
use std::time::Duration;

const MIN_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(1);

fn store_error(err: etcd_client::Error) -> RegistryError {
    RegistryError::Store(err.to_string())
}

/// [`LeaseStore`] backed by etcd.
#[derive(Clone)]
pub struct EtcdLeaseStore {
    client: Client,
}

impl fmt::Debug for EtcdLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EtcdLeaseStore").finish_non_exhaustive()
    }
}

impl EtcdLeaseStore {
    /// Dials the endpoints of `config`, with credentials and TLS when set.
    pub async fn connect(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let mut options = ConnectOptions::new();
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.as_str(), password.as_str());
        }
        if let Some(tls) = &config.tls {
            let material = TlsMaterial::parse(tls)?;
            let mut tls_options = TlsOptions::new();
            if let Some(ca) = material.ca {
                tls_options = tls_options.ca_certificate(Certificate::from_pem(ca));
            }
            if let Some((cert, key)) = material.identity {
                tls_options = tls_options.identity(Identity::from_pem(cert, key));
            }
            options = options.with_tls(tls_options);
        }
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(store_error)?;
        Ok(EtcdLeaseStore { client })
    }
}

async fn keep_alive_loop(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease: i64,
    period: Duration,
) -> RegistryError {
    loop {
        if let Err(err) = keeper.keep_alive().await {
            return store_error(err);
        }
        match stream.message().await {
            Ok(Some(response)) if response.ttl() > 0 => {}
            Ok(_) => return RegistryError::LeaseExpired(lease),
            Err(err) => return store_error(err),
        }
        tokio::time::sleep(period).await;
    }
}

impl LeaseStore for EtcdLeaseStore {
    fn grant(&self, ttl: Duration) -> BoxFuture<'_, Result<i64, RegistryError>> {
        let mut client = self.client.clone();
        Box::pin(async move {
            let response = client
                .lease_grant(ttl.as_secs() as i64, None)
                .await
                .map_err(store_error)?;
            Ok(response.id())
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        lease: i64,
    ) -> BoxFuture<'a, Result<(), RegistryError>> {
        let mut client = self.client.clone();
        Box::pin(async move {
            client
                .put(key, value, Some(PutOptions::new().with_lease(lease)))
                .await
                .map_err(store_error)?;
            Ok(())
        })
    }

    fn keep_alive(&self, lease: i64, ttl: Duration) -> BoxFuture<'_, RegistryError> {
        let mut client = self.client.clone();
        let period = (ttl / 3).max(MIN_KEEP_ALIVE_PERIOD);
        Box::pin(async move {
            match client.lease_keep_alive(lease).await {
                Ok((keeper, stream)) => keep_alive_loop(keeper, stream, lease, period).await,
                Err(err) => store_error(err),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), RegistryError>> {
        let mut client = self.client.clone();
        Box::pin(async move {
            client.delete(key, None).await.map_err(store_error)?;
            Ok(())
        })
    }
}
