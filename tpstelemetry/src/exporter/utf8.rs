//! Diagnoses export requests a collector rejected for invalid UTF-8.
//!
//! Request strings are valid UTF-8 by construction, so what a collector trips
//! over is either a bytes value holding non-UTF-8 data that a downstream hop
//! re-encodes as text, or a string carrying U+FFFD left behind by a lossy
//! conversion upstream. Both are reported with the path to the offending value.
//!
//! Enabled when `OTEL_SDK_DEBUG` contains `utf8`.
use crate::error::ExportError;
use crate::tps_warn;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
use std::sync::OnceLock;

/// Debug switch variable.
pub const OTEL_SDK_DEBUG: &str = "OTEL_SDK_DEBUG";

const INVALID_UTF8: &str = "invalid UTF-8";

/// One suspicious value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Finding {
    pub(crate) kind: &'static str,
    pub(crate) path: String,
    pub(crate) value: String,
}

pub(crate) fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| enabled_by(std::env::var(OTEL_SDK_DEBUG).ok().as_deref()))
}

fn enabled_by(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.contains("utf8"))
}

/// Whether `err` is a collector rejection caused by string encoding.
pub(crate) fn is_invalid_utf8(err: &ExportError) -> bool {
    err.status()
        .is_some_and(|status| status.message().contains(INVALID_UTF8))
}

/// Logs every finding when the guard is enabled and `err` calls for it.
pub(crate) fn diagnose<F>(err: &ExportError, findings: F)
where
    F: FnOnce() -> Vec<Finding>,
{
    if !enabled() || !is_invalid_utf8(err) {
        return;
    }
    for finding in findings() {
        tps_warn!(
            name: "Exporter.InvalidUtf8",
            kind = finding.kind,
            path = finding.path.as_str(),
            value = finding.value.as_str()
        );
    }
}

/// Walks every attribute of every span in `request`.
pub(crate) fn spans(request: &ExportTraceServiceRequest) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (r, resource_spans) in request.resource_spans.iter().enumerate() {
        if let Some(resource) = &resource_spans.resource {
            walk_attributes("span", &format!("resource_spans[{r}].resource"), &resource.attributes, &mut findings);
        }
        for (s, scope_spans) in resource_spans.scope_spans.iter().enumerate() {
            for (i, span) in scope_spans.spans.iter().enumerate() {
                let path = format!("resource_spans[{r}].scope_spans[{s}].spans[{i}]");
                check_str("span", &format!("{path}.name"), &span.name, &mut findings);
                walk_attributes("span", &path, &span.attributes, &mut findings);
                for (e, event) in span.events.iter().enumerate() {
                    walk_attributes("span", &format!("{path}.events[{e}]"), &event.attributes, &mut findings);
                }
                for (l, link) in span.links.iter().enumerate() {
                    walk_attributes("span", &format!("{path}.links[{l}]"), &link.attributes, &mut findings);
                }
            }
        }
    }
    findings
}

/// Walks the body and attributes of every record in `request`.
pub(crate) fn logs(request: &ExportLogsServiceRequest) -> Vec<Finding> {
    let mut findings = Vec::new();
    for (r, resource_logs) in request.resource_logs.iter().enumerate() {
        if let Some(resource) = &resource_logs.resource {
            walk_attributes("log", &format!("resource_logs[{r}].resource"), &resource.attributes, &mut findings);
        }
        for (s, scope_logs) in resource_logs.scope_logs.iter().enumerate() {
            for (i, record) in scope_logs.log_records.iter().enumerate() {
                let path = format!("resource_logs[{r}].scope_logs[{s}].log_records[{i}]");
                if let Some(body) = &record.body {
                    walk_value("log", &format!("{path}.body"), body, &mut findings);
                }
                walk_attributes("log", &path, &record.attributes, &mut findings);
            }
        }
    }
    findings
}

fn walk_attributes(kind: &'static str, parent: &str, attributes: &[KeyValue], findings: &mut Vec<Finding>) {
    for kv in attributes {
        let path = format!("{parent}.attributes[{}]", kv.key);
        check_str(kind, &path, &kv.key, findings);
        if let Some(value) = &kv.value {
            walk_value(kind, &path, value, findings);
        }
    }
}

fn walk_value(kind: &'static str, path: &str, value: &AnyValue, findings: &mut Vec<Finding>) {
    match &value.value {
        Some(Value::StringValue(s)) => check_str(kind, path, s, findings),
        Some(Value::BytesValue(bytes)) => {
            if std::str::from_utf8(bytes).is_err() {
                findings.push(Finding {
                    kind,
                    path: path.to_string(),
                    value: String::from_utf8_lossy(bytes).into_owned(),
                });
            }
        }
        Some(Value::ArrayValue(array)) => {
            for (i, item) in array.values.iter().enumerate() {
                walk_value(kind, &format!("{path}[{i}]"), item, findings);
            }
        }
        Some(Value::KvlistValue(list)) => walk_attributes(kind, path, &list.values, findings),
        _ => {}
    }
}

fn check_str(kind: &'static str, path: &str, s: &str, findings: &mut Vec<Finding>) {
    if s.contains(char::REPLACEMENT_CHARACTER) {
        findings.push(Finding {
            kind,
            path: path.to_string(),
            value: s.to_string(),
        });
    }
}
