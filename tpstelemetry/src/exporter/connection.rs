use super::{guard, ExporterConfig};
use crate::error::{ExportError, ExportResult};
use crate::grpc::{self, TenantInterceptor};
use crate::retry::{retry_with_backoff, RetryError};
use crate::retry_classification::classify_export_error;
use crate::runtime::{self, BackgroundTask};
use crate::self_metrics::SelfMetrics;
use crate::{tps_debug, tps_info, tps_warn};
use arc_swap::ArcSwapOption;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};

// Upper bound of the random extra pause after a reconnect, as a share of the period.
const RECONNECT_JITTER: f64 = 0.7;

/// Connection state shared between the send path and the reconnect loop.
struct Link {
    endpoint: Endpoint,
    channel: ArcSwapOption<Channel>,
    // `None` while connected.
    error: ArcSwapOption<ExportError>,
    disconnect: mpsc::Sender<()>,
}

impl Link {
    fn mark_broken(&self, err: &ExportError) {
        self.error
            .store(Some(Arc::new(ExportError::Transport(err.to_string()))));
        // one pending signal is enough
        let _ = self.disconnect.try_send(());
    }
}

#[derive(Default)]
struct State {
    started: bool,
    stopped: bool,
    signals: Option<mpsc::Receiver<()>>,
    reconnector: Option<(watch::Sender<bool>, BackgroundTask)>,
}

/// Connection lifecycle shared by the trace, log and metric exporters.
pub(crate) struct Connection {
    config: ExporterConfig,
    link: Arc<Link>,
    interceptor: TenantInterceptor,
    metrics: SelfMetrics,
    state: Mutex<State>,
    send_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.config.endpoint)
            .field("connected", &self.link.error.load().is_none())
            .finish()
    }
}

impl Connection {
    /// Validates the endpoint. Nothing is dialed until [`Connection::start`].
    pub(crate) fn new(config: ExporterConfig, metrics: SelfMetrics) -> Result<Self, ExportError> {
        let endpoint = grpc::endpoint(&config.endpoint, config.timeout)?;
        let (disconnect, signals) = mpsc::channel(1);
        Ok(Connection {
            interceptor: TenantInterceptor::new(&config.tenant_id),
            link: Arc::new(Link {
                endpoint,
                channel: ArcSwapOption::empty(),
                error: ArcSwapOption::empty(),
                disconnect,
            }),
            metrics,
            state: Mutex::new(State {
                signals: Some(signals),
                ..Default::default()
            }),
            send_lock: tokio::sync::Mutex::new(()),
            config,
        })
    }

    pub(crate) fn interceptor(&self) -> TenantInterceptor {
        self.interceptor.clone()
    }

    pub(crate) fn metrics(&self) -> &SelfMetrics {
        &self.metrics
    }

    /// Whether a transport error is pending.
    pub(crate) fn is_connected(&self) -> bool {
        self.link.error.load().is_none()
    }

    /// Dials lazily and launches the reconnect loop. Must be called within a
    /// Tokio runtime.
    pub(crate) fn start(&self) -> ExportResult {
        let mut state = self.state.lock().map_err(|_| ExportError::Stopped)?;
        if state.stopped {
            return Err(ExportError::Stopped);
        }
        if state.started {
            return Err(ExportError::AlreadyStarted);
        }
        let Some(signals) = state.signals.take() else {
            return Err(ExportError::AlreadyStarted);
        };

        self.link
            .channel
            .store(Some(Arc::new(grpc::lazy_channel(&self.link.endpoint))));
        self.link.error.store(None);

        let (stop, stopped) = watch::channel(false);
        let task = runtime::spawn(
            "tps-exporter-reconnect",
            reconnect_loop(
                self.link.clone(),
                signals,
                stopped,
                self.config.reconnection_period,
            ),
        );
        state.reconnector = Some((stop, task));
        state.started = true;
        tps_debug!(name: "Exporter.Started", endpoint = self.config.endpoint.as_str());
        Ok(())
    }

    /// Sends one request through the retry envelope.
    ///
    /// `call` builds one attempt on the current channel. `timeout` bounds the
    /// whole call: waiting for the send lock, every attempt and every backoff.
    pub(crate) async fn send<F, Fut>(
        &self,
        signal: &'static str,
        timeout: Option<Duration>,
        call: F,
    ) -> ExportResult
    where
        F: Fn(Channel) -> Fut,
        Fut: Future<Output = Result<(), tonic::Status>>,
    {
        self.check_running()?;
        if let Some(err) = self.link.error.load_full() {
            tps_debug!(name: "Exporter.FailFast", signal = signal, error = format!("{err}"));
            return Err(ExportError::Disconnected);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let elapsed = || timeout.map_or(ExportError::Cancelled, ExportError::Timeout);

        let _guard = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.send_lock.lock())
                .await
                .map_err(|_| elapsed())?,
            None => self.send_lock.lock().await,
        };
        let channel = self.link.channel.load_full().ok_or(ExportError::Stopped)?;

        let attempt = || {
            let rpc = guard::catch_async(signal, &self.metrics, call(Channel::clone(&channel)));
            async move {
                let outcome = match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, rpc)
                        .await
                        .map_err(|_| elapsed())?,
                    None => rpc.await,
                };
                outcome?.map_err(ExportError::from)
            }
        };

        let result = retry_with_backoff(
            &self.config.retry,
            signal,
            deadline,
            attempt,
            classify_export_error,
        )
        .await
        .map_err(|err| match err {
            RetryError::Permanent(err) => err,
            RetryError::Elapsed(err) => ExportError::RetryElapsed(Box::new(err)),
            RetryError::Cancelled => elapsed(),
        });

        if let Err(err) = &result {
            if err.is_transport() {
                tps_warn!(name: "Exporter.Disconnected", signal = signal, error = format!("{err}"));
                self.link.mark_broken(err);
            }
        }
        result
    }

    /// Drops the channel and stops the reconnect loop. A second call returns `Ok`.
    pub(crate) async fn shutdown(&self) -> ExportResult {
        let reconnector = {
            let mut state = self.state.lock().map_err(|_| ExportError::Stopped)?;
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            state.reconnector.take()
        };

        self.link.channel.store(None);
        if let Some((stop, task)) = reconnector {
            let _ = stop.send(true);
            task.join()
                .await
                .map_err(ExportError::Transport)?;
        }
        tps_debug!(name: "Exporter.Stopped", endpoint = self.config.endpoint.as_str());
        Ok(())
    }

    fn check_running(&self) -> ExportResult {
        let state = self.state.lock().map_err(|_| ExportError::Stopped)?;
        if state.stopped {
            Err(ExportError::Stopped)
        } else if !state.started {
            Err(ExportError::NotStarted)
        } else {
            Ok(())
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let Some((stop, _)) = &state.reconnector {
                let _ = stop.send(true);
            }
        }
    }
}

async fn reconnect_loop(
    link: Arc<Link>,
    mut signals: mpsc::Receiver<()>,
    mut stopped: watch::Receiver<bool>,
    period: Duration,
) {
    loop {
        tokio::select! {
            biased;
            _ = stopped.changed() => return,
            signal = signals.recv() => {
                if signal.is_none() {
                    return;
                }
            }
        }

        let dialed = tokio::select! {
            biased;
            _ = stopped.changed() => return,
            dialed = link.endpoint.connect() => dialed,
        };
        match dialed {
            Ok(channel) => {
                link.channel.store(Some(Arc::new(channel)));
                link.error.store(None);
                tps_info!(name: "Exporter.Reconnected", endpoint = link.endpoint.uri().to_string());
            }
            Err(err) => {
                tps_warn!(name: "Exporter.ReconnectFailed", error = format!("{err}"));
                link.error
                    .store(Some(Arc::new(ExportError::Transport(err.to_string()))));
                // try again after the pause
                let _ = link.disconnect.try_send(());
            }
        }

        let jitter = period.mul_f64(rand::rng().random_range(0.0..RECONNECT_JITTER));
        tokio::select! {
            biased;
            _ = stopped.changed() => return,
            _ = tokio::time::sleep(period + jitter) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connection(retry: RetryConfig) -> Connection {
        let config = ExporterConfig::new("http://127.0.0.1:1")
            .with_retry(retry)
            .with_reconnection_period(Duration::from_millis(10));
        Connection::new(config, SelfMetrics::new(&Registry::new())).unwrap()
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let conn = connection(RetryConfig::disabled());
        let result = conn.send("trace", None, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ExportError::NotStarted)));

        conn.start().unwrap();
        assert!(matches!(conn.start(), Err(ExportError::AlreadyStarted)));

        conn.shutdown().await.unwrap();
        conn.shutdown().await.unwrap();
        assert!(matches!(conn.start(), Err(ExportError::Stopped)));
        let result = conn.send("trace", None, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ExportError::Stopped)));
    }

    #[test]
    fn rejects_bad_scheme() {
        let config = ExporterConfig::new("ftp://collector");
        let err = Connection::new(config, SelfMetrics::new(&Registry::new())).unwrap_err();
        assert!(matches!(err, ExportError::InvalidEndpoint { .. }));
    }

    #[tokio::test]
    async fn transport_error_fails_fast_until_reconnected() {
        let conn = connection(RetryConfig::disabled());
        conn.start().unwrap();

        let result = conn
            .send("trace", None, |_| async { Err(tonic::Status::unavailable("down")) })
            .await;
        assert!(matches!(result, Err(ExportError::Status(_))));
        assert!(!conn.is_connected());

        let calls = AtomicUsize::new(0);
        let result = conn
            .send("trace", None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(ExportError::Disconnected)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        conn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn permanent_status_keeps_connection() {
        let conn = connection(RetryConfig::default());
        conn.start().unwrap();

        let calls = AtomicUsize::new(0);
        let result = conn
            .send("logs", None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(tonic::Status::invalid_argument("bad batch")) }
            })
            .await;
        assert!(matches!(result, Err(ExportError::Status(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(conn.is_connected());

        conn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn deadline_bounds_a_hanging_attempt() {
        let conn = connection(RetryConfig::disabled());
        conn.start().unwrap();

        let result = conn
            .send("metrics", Some(Duration::from_millis(20)), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ExportError::Timeout(_))));

        conn.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_attempt_is_recovered() {
        let conn = connection(RetryConfig::disabled());
        conn.start().unwrap();

        let result = conn
            .send("trace", None, |_| async {
                let empty: Vec<tonic::Status> = Vec::new();
                Err(empty[0].clone())
            })
            .await;
        assert!(matches!(result, Err(ExportError::Panic(_))));
        assert_eq!(conn.metrics().sdk_panic_count(), 1);

        conn.shutdown().await.unwrap();
    }
}
