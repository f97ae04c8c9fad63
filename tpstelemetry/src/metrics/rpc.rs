use crate::codes::CodeMapper;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

const LABELS: [&str; 8] = [
    "system",
    "caller_service",
    "caller_method",
    "callee_service",
    "callee_method",
    "code",
    "code_type",
    "code_desc",
];
const RPC_TYPE_LABEL: &str = "rpc_type";

/// Which end of the call is reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The caller.
    Client,
    /// The callee.
    Server,
}

impl Side {
    /// Family name prefix, `rpc_client` or `rpc_server`.
    pub fn prefix(&self) -> &'static str {
        match self {
            Side::Client => "rpc_client",
            Side::Server => "rpc_server",
        }
    }

    /// Side owning the family `name`, if it is an RPC family.
    pub fn of_family(name: &str) -> Option<Side> {
        if name.starts_with("rpc_client_") {
            Some(Side::Client)
        } else if name.starts_with("rpc_server_") {
            Some(Side::Server)
        } else {
            None
        }
    }
}

/// Streaming shape of a call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RpcType {
    /// One request, one response.
    #[default]
    Unary,
    /// A request stream and one response.
    ClientStream,
    /// One request and a response stream.
    ServerStream,
    /// Streams both ways.
    BidiStream,
}

impl RpcType {
    /// Label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcType::Unary => "unary",
            RpcType::ClientStream => "client_stream",
            RpcType::ServerStream => "server_stream",
            RpcType::BidiStream => "bidi_stream",
        }
    }
}

/// One finished call.
#[derive(Clone, Debug, Default)]
pub struct RpcReport {
    /// RPC system, e.g. `trpc` or `grpc`.
    pub system: String,
    /// Calling service.
    pub caller_service: String,
    /// Calling method.
    pub caller_method: String,
    /// Called service.
    pub callee_service: String,
    /// Called method.
    pub callee_method: String,
    /// Return code as text, `"0"` or empty on success.
    pub code: String,
    /// Streaming shape, only labelled by stream reporters.
    pub rpc_type: RpcType,
    /// Time from start to the last response.
    pub duration: Duration,
}

#[derive(Clone, Debug)]
struct Families {
    started: IntCounterVec,
    handled: IntCounterVec,
    handled_seconds: HistogramVec,
}

impl Families {
    fn new(side: Side, labels: &[&str]) -> prometheus::Result<Self> {
        let prefix = side.prefix();
        Ok(Families {
            started: IntCounterVec::new(
                Opts::new(format!("{prefix}_started_total"), "RPCs started."),
                labels,
            )?,
            handled: IntCounterVec::new(
                Opts::new(format!("{prefix}_handled_total"), "RPCs completed, by code class."),
                labels,
            )?,
            handled_seconds: HistogramVec::new(
                HistogramOpts::new(format!("{prefix}_handled_seconds"), "RPC latency in seconds."),
                labels,
            )?,
        })
    }

    fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.started.clone()))?;
        registry.register(Box::new(self.handled.clone()))?;
        registry.register(Box::new(self.handled_seconds.clone()))
    }

    fn reset(&self) {
        self.started.reset();
        self.handled.reset();
        self.handled_seconds.reset();
    }
}

/// RPC counters and latency histograms for both sides of a call, with codes
/// classified through a [`CodeMapper`].
///
/// Clones share the collectors.
#[derive(Clone, Debug)]
pub struct RpcMetrics {
    client: Families,
    server: Families,
    mapper: CodeMapper,
    with_rpc_type: bool,
}

impl RpcMetrics {
    /// Registers the unary families on `registry`.
    pub fn new(registry: &Registry, mapper: CodeMapper) -> prometheus::Result<Self> {
        Self::build(registry, mapper, false)
    }

    /// Registers families carrying an extra `rpc_type` label.
    pub fn with_rpc_type(registry: &Registry, mapper: CodeMapper) -> prometheus::Result<Self> {
        Self::build(registry, mapper, true)
    }

    fn build(registry: &Registry, mapper: CodeMapper, with_rpc_type: bool) -> prometheus::Result<Self> {
        let mut labels = LABELS.to_vec();
        if with_rpc_type {
            labels.push(RPC_TYPE_LABEL);
        }
        let metrics = RpcMetrics {
            client: Families::new(Side::Client, &labels)?,
            server: Families::new(Side::Server, &labels)?,
            mapper,
            with_rpc_type,
        };
        metrics.client.register(registry)?;
        metrics.server.register(registry)?;
        Ok(metrics)
    }

    /// Records one finished call on `side`.
    pub fn report(&self, side: Side, report: &RpcReport) {
        let class = self
            .mapper
            .code_mapping(&report.code, &report.callee_service, &report.callee_method);
        let mut values = vec![
            report.system.as_str(),
            report.caller_service.as_str(),
            report.caller_method.as_str(),
            report.callee_service.as_str(),
            report.callee_method.as_str(),
            report.code.as_str(),
            class.code_type.as_str(),
            &*class.description,
        ];
        if self.with_rpc_type {
            values.push(report.rpc_type.as_str());
        }

        let families = self.families(side);
        families.started.with_label_values(&values).inc();
        families.handled.with_label_values(&values).inc();
        families
            .handled_seconds
            .with_label_values(&values)
            .observe(report.duration.as_secs_f64());
    }

    /// Clears every series of `side`.
    pub fn reset(&self, side: Side) {
        self.families(side).reset();
    }

    fn families(&self, side: Side) -> &Families {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{CodeEntry, CodeType};

    fn family<'a>(
        families: &'a [prometheus::proto::MetricFamily],
        name: &str,
    ) -> &'a prometheus::proto::MetricFamily {
        families
            .iter()
            .find(|f| f.name() == name)
            .unwrap_or_else(|| panic!("family {name} missing"))
    }

    fn label<'a>(metric: &'a prometheus::proto::Metric, name: &str) -> &'a str {
        metric
            .get_label()
            .iter()
            .find(|l| l.name() == name)
            .map(|l| l.value())
            .unwrap_or_default()
    }

    fn report(code: &str) -> RpcReport {
        RpcReport {
            system: "trpc".into(),
            caller_service: "gateway".into(),
            caller_method: "/Route".into(),
            callee_service: "user".into(),
            callee_method: "/Get".into(),
            code: code.into(),
            duration: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn report_classifies_codes() {
        let registry = Registry::new();
        let mapper = CodeMapper::new(vec![
            CodeEntry::new("101", CodeType::Timeout, "deadline").with_service("user")
        ]);
        let metrics = RpcMetrics::new(&registry, mapper).unwrap();

        metrics.report(Side::Client, &report("0"));
        metrics.report(Side::Client, &report("101"));
        metrics.report(Side::Client, &report("101"));
        metrics.report(Side::Server, &report("7"));

        let families = registry.gather();
        let handled = family(&families, "rpc_client_handled_total");
        assert_eq!(handled.get_metric().len(), 2);
        let timeout = handled
            .get_metric()
            .iter()
            .find(|m| label(m, "code") == "101")
            .unwrap();
        assert_eq!(label(timeout, "code_type"), "timeout");
        assert_eq!(label(timeout, "code_desc"), "deadline");
        assert_eq!(timeout.counter.value(), 2.0);

        let server = family(&families, "rpc_server_handled_total");
        assert_eq!(label(&server.get_metric()[0], "code_type"), "exception");
        assert_eq!(label(&server.get_metric()[0], "code_desc"), "code!=0");

        let seconds = family(&families, "rpc_client_handled_seconds");
        let total: u64 = seconds
            .get_metric()
            .iter()
            .map(|m| m.histogram.sample_count())
            .sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn stream_variant_labels_rpc_type() {
        let registry = Registry::new();
        let metrics = RpcMetrics::with_rpc_type(&registry, CodeMapper::default()).unwrap();
        let mut streaming = report("0");
        streaming.rpc_type = RpcType::BidiStream;
        metrics.report(Side::Server, &streaming);

        let families = registry.gather();
        let started = family(&families, "rpc_server_started_total");
        assert_eq!(label(&started.get_metric()[0], "rpc_type"), "bidi_stream");
    }

    #[test]
    fn reset_clears_one_side() {
        let registry = Registry::new();
        let metrics = RpcMetrics::new(&registry, CodeMapper::default()).unwrap();
        metrics.report(Side::Client, &report("0"));
        metrics.report(Side::Server, &report("0"));
        metrics.reset(Side::Client);

        let families = registry.gather();
        assert!(families
            .iter()
            .filter(|f| f.name().starts_with("rpc_client_"))
            .all(|f| f.get_metric().is_empty()));
        assert!(families.iter().any(|f| f.name() == "rpc_server_started_total"));
    }

    #[test]
    fn registering_twice_fails() {
        let registry = Registry::new();
        RpcMetrics::new(&registry, CodeMapper::default()).unwrap();
        assert!(RpcMetrics::new(&registry, CodeMapper::default()).is_err());
    }

    #[test]
    fn family_sides() {
        assert_eq!(Side::of_family("rpc_client_handled_total"), Some(Side::Client));
        assert_eq!(Side::of_family("rpc_server_started_total"), Some(Side::Server));
        assert_eq!(Side::of_family("process_cpu_seconds_total"), None);
    }
}
