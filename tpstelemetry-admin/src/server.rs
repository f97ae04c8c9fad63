//! # Admin server
//!
//! A small HTTP/1 server on its own port:
//!
//! | path | effect |
//! |------|--------|
//! | `GET /metrics` | prometheus text scrape through the cardinality guard |
//! | `/cmds/enabletrace` | turns tracing on |
//! | `/cmds/disabletrace` | turns tracing off, tracers hand out non-recording spans |
//! | `/cmds/tracestatus` | reports the trace switch |
//! | `GET /debug/tracez` | span summary, `?name=&kind=running\|error\|latency&bucket=` for samples |
//! | `GET /debug/pprof/profile` | `?seconds=` CPU flamegraph, with the `pprof` feature |
use crate::error::AdminError;
use crate::tracez::render::{render_spans, render_summaries, LATENCY_LABELS};
use crate::tracez::{TracezConfig, TracezQuerier, TracezQuery, TracezResponse};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tpstelemetry::metrics::CardinalityGuard;
use tpstelemetry::trace::TraceSwitch;
use tpstelemetry::{tps_debug, tps_info, tps_warn, Telemetry};

/// Listen address used when none is configured.
pub const DEFAULT_ADDR: &str = "127.0.0.1:11014";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const TEXT: &str = "text/plain; charset=utf-8";
const HTML: &str = "text/html; charset=utf-8";

/// Admin server settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdminConfig {
    /// `host:port` to listen on.
    pub addr: String,
    /// Tracez buffer sizes.
    pub tracez: TracezConfig,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            addr: DEFAULT_ADDR.to_string(),
            tracez: TracezConfig::default(),
        }
    }
}

type Body = Full<Bytes>;

#[derive(Debug)]
struct AdminState {
    switch: TraceSwitch,
    guard: Option<CardinalityGuard>,
    tracez: Option<TracezQuerier>,
}

/// Admin server, configured before it is bound.
#[derive(Debug)]
pub struct AdminServer {
    state: AdminState,
}

impl AdminServer {
    /// Serves the `/cmds/*` endpoints for `switch`.
    pub fn new(switch: TraceSwitch) -> Self {
        AdminServer {
            state: AdminState {
                switch,
                guard: None,
                tracez: None,
            },
        }
    }

    /// Serves the trace switch and the guarded registry of `telemetry`.
    pub fn from_telemetry(telemetry: &Telemetry) -> Self {
        AdminServer::new(telemetry.trace_switch().clone())
            .with_metrics(telemetry.cardinality_guard())
    }

    /// Serves `/metrics` from `guard`.
    pub fn with_metrics(mut self, guard: CardinalityGuard) -> Self {
        self.state.guard = Some(guard);
        self
    }

    /// Serves `/debug/tracez` from `querier`.
    pub fn with_tracez(mut self, querier: TracezQuerier) -> Self {
        self.state.tracez = Some(querier);
        self
    }

    /// Binds `addr` and starts serving on the current runtime.
    pub async fn bind(self, addr: &str) -> Result<AdminHandle, AdminError> {
        let bind_error = |source| AdminError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        tps_info!(name: "AdminServer.Listening", addr = local_addr.to_string());

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(serve(listener, Arc::new(self.state), stopped));
        Ok(AdminHandle {
            local_addr,
            stop: Some(stop),
            task: Some(task),
        })
    }
}

/// A running admin server. Dropping it stops accepting connections.
#[derive(Debug)]
pub struct AdminHandle {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AdminHandle {
    /// The bound address, useful with port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for the accept loop to exit.
    /// Connections already accepted finish on their own.
    pub async fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AdminHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn serve(listener: TcpListener, state: Arc<AdminState>, mut stopped: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |request: Request<Incoming>| {
                            let state = state.clone();
                            let method = request.method().clone();
                            let uri = request.uri().clone();
                            async move { Ok::<_, Infallible>(route(&state, method, uri).await) }
                        });
                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            tps_debug!(
                                name: "AdminServer.ConnectionError",
                                peer = peer.to_string(),
                                error = err.to_string(),
                            );
                        }
                    });
                }
                Err(err) => {
                    tps_warn!(name: "AdminServer.AcceptFailed", error = err.to_string());
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    tps_info!(name: "AdminServer.Stopped");
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    respond(status, TEXT, body)
}

async fn route(state: &AdminState, method: Method, uri: Uri) -> Response<Body> {
    let query = uri.query().unwrap_or_default();
    match (&method, uri.path()) {
        (&Method::GET, "/metrics") => metrics(state),
        (_, "/cmds/enabletrace") => {
            state.switch.set(true);
            tps_info!(name: "AdminServer.TraceEnabled");
            text(StatusCode::OK, "trace enabled\n")
        }
        (_, "/cmds/disabletrace") => {
            state.switch.set(false);
            tps_info!(name: "AdminServer.TraceDisabled");
            text(StatusCode::OK, "trace disabled\n")
        }
        (_, "/cmds/tracestatus") => {
            if state.switch.is_enabled() {
                text(StatusCode::OK, "trace enabled\n")
            } else {
                text(StatusCode::OK, "trace disabled\n")
            }
        }
        (&Method::GET, "/debug/tracez") => tracez(state, query).await,
        #[cfg(feature = "pprof")]
        (&Method::GET, "/debug/pprof/profile") => profile(query).await,
        _ => text(StatusCode::NOT_FOUND, "404 page not found\n"),
    }
}

fn metrics(state: &AdminState) -> Response<Body> {
    let Some(guard) = &state.guard else {
        return text(StatusCode::NOT_FOUND, "metrics are not served\n");
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&guard.gather(), &mut buffer) {
        Ok(()) => respond(StatusCode::OK, prometheus::TEXT_FORMAT, buffer),
        Err(err) => {
            let err = AdminError::from(err);
            tps_warn!(name: "AdminServer.EncodeFailed", error = err.to_string());
            text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| {
            percent_decode_str(&value.replace('+', " "))
                .decode_utf8_lossy()
                .into_owned()
        })
}

fn parse_tracez_query(query: &str) -> Result<TracezQuery, &'static str> {
    let Some(span_name) = query_param(query, "name") else {
        return Ok(TracezQuery::Aggregation);
    };
    match query_param(query, "kind").as_deref() {
        Some("running") => Ok(TracezQuery::Running { span_name }),
        Some("error") => Ok(TracezQuery::Error { span_name }),
        Some("latency") => query_param(query, "bucket")
            .and_then(|bucket| bucket.parse::<usize>().ok())
            .filter(|bucket| *bucket < LATENCY_LABELS.len())
            .map(|bucket| TracezQuery::Latency { span_name, bucket })
            .ok_or("invalid latency bucket\n"),
        _ => Err("kind must be running, error or latency\n"),
    }
}

fn title(query: &TracezQuery) -> String {
    match query {
        TracezQuery::Aggregation => "tracez".to_string(),
        TracezQuery::Running { span_name } => format!("{span_name}: running"),
        TracezQuery::Error { span_name } => format!("{span_name}: errors"),
        TracezQuery::Latency { span_name, bucket } => {
            format!("{span_name}: latency {}", LATENCY_LABELS[*bucket])
        }
    }
}

async fn tracez(state: &AdminState, query: &str) -> Response<Body> {
    let Some(querier) = &state.tracez else {
        return text(StatusCode::NOT_FOUND, "tracez is not enabled\n");
    };
    let query = match parse_tracez_query(query) {
        Ok(query) => query,
        Err(reason) => return text(StatusCode::BAD_REQUEST, reason),
    };
    let title = title(&query);
    match querier.query(query).await {
        Ok(TracezResponse::Aggregation(summaries)) => {
            respond(StatusCode::OK, HTML, render_summaries(&summaries))
        }
        Ok(TracezResponse::Spans(spans)) => respond(StatusCode::OK, HTML, render_spans(&title, &spans)),
        Err(err) => text(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
    }
}

#[cfg(feature = "pprof")]
async fn profile(query: &str) -> Response<Body> {
    let seconds = match query_param(query, "seconds").map(|s| s.parse::<u64>()) {
        None => crate::profile::DEFAULT_PROFILE_DURATION,
        Some(Ok(seconds)) if seconds > 0 => Duration::from_secs(seconds),
        Some(_) => return text(StatusCode::BAD_REQUEST, "seconds must be a positive integer\n"),
    };
    match crate::profile::profile(seconds).await {
        Ok(svg) => respond(StatusCode::OK, "image/svg+xml", svg),
        Err(err) => {
            tps_warn!(name: "AdminServer.ProfileFailed", error = err.to_string());
            text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
