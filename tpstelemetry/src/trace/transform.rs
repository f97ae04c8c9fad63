use crate::resource::Resource;
use crate::trace::{Link, SpanData};
use crate::transform::{key_value, scope, to_nanos};
use opentelemetry::trace::{SpanId, SpanKind, Status};
use opentelemetry_proto::tonic::trace::v1::{
    span, status, ResourceSpans, ScopeSpans, Span, Status as ProtoStatus,
};
use std::collections::HashMap;

#[allow(unreachable_patterns)]
fn span_kind(kind: &SpanKind) -> span::SpanKind {
    match kind {
        SpanKind::Client => span::SpanKind::Client,
        SpanKind::Server => span::SpanKind::Server,
        SpanKind::Producer => span::SpanKind::Producer,
        SpanKind::Consumer => span::SpanKind::Consumer,
        SpanKind::Internal => span::SpanKind::Internal,
        _ => span::SpanKind::Unspecified,
    }
}

fn proto_status(source: &Status) -> ProtoStatus {
    match source {
        Status::Ok => ProtoStatus {
            code: status::StatusCode::Ok as i32,
            ..Default::default()
        },
        Status::Error { description } => ProtoStatus {
            code: status::StatusCode::Error as i32,
            message: description.to_string(),
        },
        Status::Unset => ProtoStatus::default(),
    }
}

fn proto_link(link: &Link) -> span::Link {
    span::Link {
        trace_id: link.span_context.trace_id().to_bytes().to_vec(),
        span_id: link.span_context.span_id().to_bytes().to_vec(),
        trace_state: link.span_context.trace_state().header(),
        attributes: link.attributes.iter().map(key_value).collect(),
        ..Default::default()
    }
}

impl From<&SpanData> for Span {
    fn from(source: &SpanData) -> Self {
        Span {
            trace_id: source.span_context.trace_id().to_bytes().to_vec(),
            span_id: source.span_context.span_id().to_bytes().to_vec(),
            trace_state: source.span_context.trace_state().header(),
            parent_span_id: if source.parent_span_id != SpanId::INVALID {
                source.parent_span_id.to_bytes().to_vec()
            } else {
                vec![]
            },
            flags: u32::from(source.span_context.trace_flags().to_u8()),
            name: source.name.to_string(),
            kind: span_kind(&source.span_kind) as i32,
            start_time_unix_nano: to_nanos(source.start_time),
            end_time_unix_nano: to_nanos(source.end_time),
            attributes: source.attributes.iter().map(key_value).collect(),
            events: source
                .events
                .iter()
                .map(|event| span::Event {
                    time_unix_nano: to_nanos(event.timestamp),
                    name: event.name.to_string(),
                    attributes: event.attributes.iter().map(key_value).collect(),
                    dropped_attributes_count: 0,
                })
                .collect(),
            links: source.links.iter().map(proto_link).collect(),
            status: Some(proto_status(&source.status)),
            ..Default::default()
        }
    }
}

/// Builds one `ResourceSpans` for a batch, grouping spans by the tracer that
/// created them. Span order inside a scope follows the batch order.
pub fn group_spans_by_scope(spans: &[SpanData], resource: &Resource) -> ResourceSpans {
    let mut order: Vec<&str> = Vec::new();
    let mut grouped: HashMap<&str, Vec<Span>> = HashMap::new();
    for data in spans {
        let name = data.scope_name.as_ref();
        grouped
            .entry(name)
            .or_insert_with(|| {
                order.push(name);
                Vec::new()
            })
            .push(Span::from(data));
    }

    let scope_spans = order
        .into_iter()
        .map(|name| ScopeSpans {
            scope: Some(scope(name)),
            spans: grouped.remove(name).unwrap_or_default(),
            schema_url: String::new(),
        })
        .collect();

    ResourceSpans {
        resource: Some(resource.into()),
        scope_spans,
        schema_url: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::test_utils::span_data;
    use opentelemetry::KeyValue;

    #[test]
    fn span_fields_are_mapped() {
        let mut data = span_data("op", true);
        data.status = Status::error("boom");
        data.attributes.push(KeyValue::new("k", "v"));
        let proto = Span::from(&data);

        assert_eq!(proto.trace_id, vec![1; 16]);
        assert_eq!(proto.span_id, vec![2; 8]);
        assert!(proto.parent_span_id.is_empty());
        assert_eq!(proto.flags, 1);
        assert_eq!(proto.kind, span::SpanKind::Internal as i32);
        let status = proto.status.unwrap();
        assert_eq!(status.code, status::StatusCode::Error as i32);
        assert_eq!(status.message, "boom");
        assert_eq!(proto.attributes[0].key, "k");
    }

    #[test]
    fn groups_by_scope_in_first_seen_order() {
        let mut a = span_data("a", true);
        a.scope_name = "server".into();
        let mut b = span_data("b", true);
        b.scope_name = "client".into();
        let mut c = span_data("c", true);
        c.scope_name = "server".into();

        let resource = Resource::new([KeyValue::new("service.name", "svc")]);
        let grouped = group_spans_by_scope(&[a, b, c], &resource);

        assert_eq!(grouped.resource.unwrap().attributes.len(), 1);
        let scopes: Vec<_> = grouped
            .scope_spans
            .iter()
            .map(|s| (s.scope.as_ref().unwrap().name.clone(), s.spans.len()))
            .collect();
        assert_eq!(scopes, vec![("server".to_string(), 2), ("client".to_string(), 1)]);
        assert_eq!(grouped.scope_spans[0].spans[1].name, "c");
    }
}
