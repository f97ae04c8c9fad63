//! HTML rendering of the tracez page.
use super::{TracezSummary, LATENCY_BUCKET_COUNT};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::fmt::Write;
use std::time::UNIX_EPOCH;
use tpstelemetry::trace::SpanData;

/// Column headers of the latency buckets.
pub const LATENCY_LABELS: [&str; LATENCY_BUCKET_COUNT] = [
    "[0, 10µs)",
    "[10µs, 100µs)",
    "[100µs, 1ms)",
    "[1ms, 10ms)",
    "[10ms, 100ms)",
    "[100ms, 1s)",
    "[1s, 10s)",
    "[10s, 100s)",
    "[100s, +inf)",
];

const HEAD: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>tracez</title>\
<style>body{font-family:monospace}td,th{padding:2px 8px;text-align:right}\
td:first-child{text-align:left}pre{background:#f4f4f4;padding:6px}</style></head><body>";
const TAIL: &str = "</body></html>";

pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn link(out: &mut String, span_name: &str, kind: &str, bucket: Option<usize>, count: usize) {
    if count == 0 {
        out.push_str("<td>0</td>");
        return;
    }
    let name = utf8_percent_encode(span_name, NON_ALPHANUMERIC);
    let _ = match bucket {
        Some(bucket) => write!(
            out,
            "<td><a href=\"?name={name}&amp;kind={kind}&amp;bucket={bucket}\">{count}</a></td>"
        ),
        None => write!(
            out,
            "<td><a href=\"?name={name}&amp;kind={kind}\">{count}</a></td>"
        ),
    };
}

/// Renders the per-name summary table. Every non-zero count links to its samples.
pub fn render_summaries(summaries: &[TracezSummary]) -> String {
    let mut out = String::from(HEAD);
    out.push_str("<h1>tracez</h1><table><tr><th>Span Name</th><th>Running</th><th>Errors</th>");
    for label in LATENCY_LABELS {
        let _ = write!(out, "<th>{}</th>", escape(label));
    }
    out.push_str("</tr>");
    for summary in summaries {
        let _ = write!(out, "<tr><td>{}</td>", escape(&summary.span_name));
        link(&mut out, &summary.span_name, "running", None, summary.running);
        link(&mut out, &summary.span_name, "error", None, summary.errors);
        for (bucket, count) in summary.latency.iter().enumerate() {
            link(&mut out, &summary.span_name, "latency", Some(bucket), *count);
        }
        out.push_str("</tr>");
    }
    out.push_str("</table>");
    out.push_str(TAIL);
    out
}

fn render_span(out: &mut String, span: &SpanData) {
    let context = &span.span_context;
    let start = span
        .start_time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let _ = writeln!(
        out,
        "trace_id={} span_id={} parent_id={} sampled={}",
        context.trace_id(),
        context.span_id(),
        span.parent_span_id,
        context.is_sampled()
    );
    let _ = writeln!(
        out,
        "start={}.{:06} duration={:?} kind={:?} status={}",
        start.as_secs(),
        start.subsec_micros(),
        span.duration(),
        span.span_kind,
        escape(&format!("{:?}", span.status))
    );
    for kv in &span.attributes {
        let _ = writeln!(
            out,
            "  {}={}",
            escape(kv.key.as_str()),
            escape(&kv.value.as_str())
        );
    }
    for event in &span.events {
        let _ = writeln!(out, "  event {}", escape(&event.name));
        for kv in &event.attributes {
            let _ = writeln!(
                out,
                "    {}={}",
                escape(kv.key.as_str()),
                escape(&kv.value.as_str())
            );
        }
    }
}

/// Renders sampled spans of one name, one block per span.
pub fn render_spans(title: &str, spans: &[SpanData]) -> String {
    let mut out = String::from(HEAD);
    let _ = write!(
        out,
        "<h1>{}</h1><p><a href=\"?\">back</a> {} span(s)</p>",
        escape(title),
        spans.len()
    );
    for span in spans {
        out.push_str("<pre>");
        render_span(&mut out, span);
        out.push_str("</pre>");
    }
    out.push_str(TAIL);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracez::test_utils::span;
    use std::time::Duration;

    #[test]
    fn summary_links_only_non_zero_counts() {
        let mut latency = [0; LATENCY_BUCKET_COUNT];
        latency[4] = 3;
        let page = render_summaries(&[TracezSummary {
            span_name: "shop/charge <v2>".into(),
            running: 0,
            errors: 2,
            latency,
        }]);
        assert!(page.contains("<td>shop/charge &lt;v2&gt;</td>"));
        assert!(page.contains("?name=shop%2Fcharge%20%3Cv2%3E&amp;kind=error\">2</a>"));
        assert!(page.contains("kind=latency&amp;bucket=4\">3</a>"));
        assert!(!page.contains("kind=running"));
    }

    #[test]
    fn spans_show_ids_and_attributes() {
        let page = render_spans(
            "charge",
            &[span("charge", 1, Duration::from_millis(5), true)],
        );
        assert!(page.contains("span_id=0000000000000001"));
        assert!(page.contains("trace_id=07070707070707070707070707070707"));
        assert!(page.contains("rpc.method=Charge"));
        assert!(page.contains("duration=5ms"));
        assert!(page.contains("1 span(s)"));
    }
}
