//! Conversions from API attribute types to their OTLP protobuf shape.
use opentelemetry::{Array, KeyValue, Value};
use opentelemetry_proto::tonic::common::v1::{
    any_value, AnyValue, ArrayValue, InstrumentationScope, KeyValue as ProtoKeyValue,
};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn key_value(kv: &KeyValue) -> ProtoKeyValue {
    ProtoKeyValue {
        key: kv.key.as_str().to_string(),
        value: Some(any_value(&kv.value)),
    }
}

pub(crate) fn string_attribute(key: impl Into<String>, value: impl Into<String>) -> ProtoKeyValue {
    ProtoKeyValue {
        key: key.into(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.into())),
        }),
    }
}

pub(crate) fn bool_attribute(key: impl Into<String>, value: bool) -> ProtoKeyValue {
    ProtoKeyValue {
        key: key.into(),
        value: Some(AnyValue {
            value: Some(any_value::Value::BoolValue(value)),
        }),
    }
}

#[allow(unreachable_patterns)]
pub(crate) fn any_value(value: &Value) -> AnyValue {
    let value = match value {
        Value::Bool(b) => any_value::Value::BoolValue(*b),
        Value::I64(i) => any_value::Value::IntValue(*i),
        Value::F64(f) => any_value::Value::DoubleValue(*f),
        Value::String(s) => any_value::Value::StringValue(s.as_str().to_string()),
        Value::Array(array) => any_value::Value::ArrayValue(ArrayValue {
            values: array_values(array),
        }),
        other => any_value::Value::StringValue(other.as_str().into_owned()),
    };
    AnyValue { value: Some(value) }
}

#[allow(unreachable_patterns)]
fn array_values(array: &Array) -> Vec<AnyValue> {
    fn wrap(value: any_value::Value) -> AnyValue {
        AnyValue { value: Some(value) }
    }
    match array {
        Array::Bool(values) => values
            .iter()
            .map(|b| wrap(any_value::Value::BoolValue(*b)))
            .collect(),
        Array::I64(values) => values
            .iter()
            .map(|i| wrap(any_value::Value::IntValue(*i)))
            .collect(),
        Array::F64(values) => values
            .iter()
            .map(|f| wrap(any_value::Value::DoubleValue(*f)))
            .collect(),
        Array::String(values) => values
            .iter()
            .map(|s| wrap(any_value::Value::StringValue(s.as_str().to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn scope(name: &str) -> InstrumentationScope {
    InstrumentationScope {
        name: name.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    }
}

pub(crate) fn to_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
