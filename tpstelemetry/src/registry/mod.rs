//! # Service registry
//!
//! Announces the process's metrics endpoint in a distributed key/value store
//! so collectors can discover and scrape it. The entry lives under a lease:
//! a [`Registrar`] keeps the lease alive, registers again with a fresh lease
//! whenever keep-alive fails, and deletes the key when stopped.
//!
//! The store is behind the [`LeaseStore`] trait; an etcd implementation is
//! available with the `etcd` feature.
use crate::error::RegistryError;
use crate::runtime::{self, BackgroundTask};
use crate::{tps_info, tps_warn};
use futures_util::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::BufReader;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

#[cfg(feature = "etcd")]
mod etcd;
#[cfg(feature = "etcd")]
pub use etcd::EtcdLeaseStore;

/// Prefix of every registration key.
pub const KEY_PREFIX: &str = "/opentelemetry/metrics/services/";

const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Inline PEM material for the store connection.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    /// CA bundle used to verify the store.
    pub ca: Option<String>,
    /// Client certificate chain.
    pub cert: Option<String>,
    /// Client private key.
    pub key: Option<String>,
}

/// Registry client settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Store endpoints.
    pub endpoints: Vec<String>,
    /// Tenant the endpoint is registered under.
    pub tenant_id: String,
    /// Advertised metrics address, `host:port`.
    pub addr: String,
    /// Appended to the key after the address.
    pub key_suffix: String,
    /// Lease time to live, rounded down to whole seconds.
    #[serde(with = "crate::config::duration_ms")]
    pub ttl: Duration,
    /// Free-form attributes stored with the address.
    pub metadata: BTreeMap<String, String>,
    /// Store user name.
    pub username: Option<String>,
    /// Store password.
    pub password: Option<String>,
    /// TLS material, plaintext when unset.
    pub tls: Option<TlsConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            endpoints: Vec::new(),
            tenant_id: String::new(),
            addr: String::new(),
            key_suffix: String::new(),
            ttl: DEFAULT_TTL,
            metadata: BTreeMap::new(),
            username: None,
            password: None,
            tls: None,
        }
    }
}

#[derive(Serialize)]
struct Registration<'a> {
    addr: &'a str,
    tenant_id: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

impl RegistryConfig {
    /// `/opentelemetry/metrics/services/<tenant>/<addr><suffix>`.
    pub fn key(&self) -> String {
        format!(
            "{KEY_PREFIX}{}/{}{}",
            self.tenant_id, self.addr, self.key_suffix
        )
    }

    /// JSON value stored under [`RegistryConfig::key`].
    pub fn value(&self) -> Result<String, RegistryError> {
        Ok(serde_json::to_string(&Registration {
            addr: &self.addr,
            tenant_id: &self.tenant_id,
            metadata: &self.metadata,
        })?)
    }
}

/// TLS material checked to hold what it claims, kept as PEM for the dialer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TlsMaterial {
    /// CA bundle.
    pub ca: Option<Vec<u8>>,
    /// Client certificate chain and private key.
    pub identity: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterial {
    /// Parses inline PEM. Certificate and key must be given together.
    pub fn parse(config: &TlsConfig) -> Result<Self, RegistryError> {
        let ca = config
            .ca
            .as_deref()
            .map(|pem| check_certificates("ca", pem))
            .transpose()?;
        let identity = match (config.cert.as_deref(), config.key.as_deref()) {
            (Some(cert), Some(key)) => {
                let cert = check_certificates("cert", cert)?;
                let key = check_private_key(key)?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) | (None, Some(_)) => {
                return Err(RegistryError::InvalidPem {
                    what: "key",
                    reason: "certificate and key must be set together".into(),
                })
            }
        };
        Ok(TlsMaterial { ca, identity })
    }
}

fn check_certificates(what: &'static str, pem: &str) -> Result<Vec<u8>, RegistryError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| RegistryError::InvalidPem {
            what,
            reason: err.to_string(),
        })?;
    if certs.is_empty() {
        return Err(RegistryError::InvalidPem {
            what,
            reason: "no certificate found".into(),
        });
    }
    Ok(pem.as_bytes().to_vec())
}

fn check_private_key(pem: &str) -> Result<Vec<u8>, RegistryError> {
    match rustls_pemfile::private_key(&mut BufReader::new(pem.as_bytes())) {
        Ok(Some(_)) => Ok(pem.as_bytes().to_vec()),
        Ok(None) => Err(RegistryError::InvalidPem {
            what: "key",
            reason: "no private key found".into(),
        }),
        Err(err) => Err(RegistryError::InvalidPem {
            what: "key",
            reason: err.to_string(),
        }),
    }
}

/// Lease-based key/value store.
pub trait LeaseStore: Send + Sync + fmt::Debug + 'static {
    /// Grants a lease of `ttl`, returning its id.
    fn grant(&self, ttl: Duration) -> BoxFuture<'_, Result<i64, RegistryError>>;

    /// Puts `key` bound to `lease`.
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        lease: i64,
    ) -> BoxFuture<'a, Result<(), RegistryError>>;

    /// Keeps `lease` alive. Resolves only once keep-alive failed.
    fn keep_alive(&self, lease: i64, ttl: Duration) -> BoxFuture<'_, RegistryError>;

    /// Deletes `key`.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), RegistryError>>;
}

/// Keeps one registration alive until stopped.
#[derive(Debug)]
pub struct Registrar {
    key: String,
    stop: watch::Sender<bool>,
    done: Option<oneshot::Receiver<Result<(), RegistryError>>>,
    task: Option<BackgroundTask>,
}

impl Registrar {
    /// Registers `config` on `store` and keeps it registered in the background.
    pub fn start<S: LeaseStore>(store: S, config: &RegistryConfig) -> Result<Self, RegistryError> {
        let key = config.key();
        let value = config.value()?;
        let ttl = config.ttl;
        let (stop, stopped) = watch::channel(false);
        let (done_tx, done) = oneshot::channel();
        let task_key = key.clone();
        let task = runtime::spawn("tps-registry", async move {
            let result = run(&store, &task_key, &value, ttl, stopped).await;
            let _ = done_tx.send(result);
        });
        Ok(Registrar {
            key,
            stop,
            done: Some(done),
            task: Some(task),
        })
    }

    /// The registered key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stops keep-alive and deletes the key. A second call returns `Ok`.
    pub async fn stop(&mut self) -> Result<(), RegistryError> {
        let (Some(done), Some(task)) = (self.done.take(), self.task.take()) else {
            return Ok(());
        };
        let _ = self.stop.send(true);
        let result = done
            .await
            .unwrap_or_else(|_| Err(RegistryError::Store("registry task is gone".into())));
        let _ = task.join().await;
        result
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

async fn run<S: LeaseStore>(
    store: &S,
    key: &str,
    value: &str,
    ttl: Duration,
    mut stopped: watch::Receiver<bool>,
) -> Result<(), RegistryError> {
    loop {
        let err = tokio::select! {
            biased;
            _ = stopped.changed() => break,
            err = register(store, key, value, ttl) => err,
        };
        let wait = retry_wait(ttl);
        tps_warn!(
            name: "Registry.LeaseLost",
            key = key,
            error = format!("{err}"),
            retry_in_ms = wait.as_millis() as u64,
        );
        tokio::select! {
            biased;
            _ = stopped.changed() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    store.delete(key).await?;
    tps_info!(name: "Registry.Deregistered", key = key);
    Ok(())
}

async fn register<S: LeaseStore>(store: &S, key: &str, value: &str, ttl: Duration) -> RegistryError {
    let lease = match store.grant(ttl).await {
        Ok(lease) => lease,
        Err(err) => return err,
    };
    if let Err(err) = store.put(key, value, lease).await {
        return err;
    }
    tps_info!(name: "Registry.Registered", key = key, lease = lease);
    store.keep_alive(lease, ttl).await
}

/// `ttl/3 + U(0, ttl/3)`.
fn retry_wait(ttl: Duration) -> Duration {
    let third = ttl / 3;
    third + third.mul_f64(rand::rng().random_range(0.0..1.0))
}
