//! Conversion of structured log entries into OTLP log records.
//!
//! Two entry points produce the same protobuf bytes for the same entry:
//! [`encode`] walks a typed [`Record`], [`encode_json`] streams a JSON line in
//! the zap layout without building an intermediate document. Both feed one
//! [`Builder`] in key order:
//!
//! | key       | OTLP                               |
//! |-----------|------------------------------------|
//! | `msg`     | body                               |
//! | `level`   | severity text and number           |
//! | `ts`      | time (float seconds)               |
//! | `traceID` | trace id, 16 bytes or empty        |
//! | `spanID`  | span id, 8 bytes or empty          |
//! | `sampled` | bool attribute `sampled`           |
//! | `caller`  | attribute `line`, always first     |
//! | other     | string attribute                   |
//!
//! Header keys (`msg`, `level`, `ts`, `caller`) always come from the header:
//! a field reusing one of them is dropped, and in a JSON line only the first
//! occurrence counts.
use super::record::{
    is_header_key, seconds_to_nanos, unix_seconds, HEADER_KEYS, SAMPLED_KEY, SPAN_ID_KEY,
    TRACE_ID_KEY,
};
use super::{FieldValue, Level, Record};
use crate::semconv;
use crate::transform::{bool_attribute, string_attribute};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, SeverityNumber};
use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::Deserializer as _;
use std::fmt;
use thiserror::Error;

const TRACE_ID_LEN: usize = 16;
const SPAN_ID_LEN: usize = 8;
// Trace flags bit set on records of sampled traces.
const SAMPLED_FLAG: u32 = 0x01;

/// Why an entry could not be encoded. The entry is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// An id decoded to the wrong number of bytes.
    #[error("{key} must be {expected} bytes or empty, got {len}")]
    InvalidIdLength {
        /// Field key.
        key: &'static str,
        /// Decoded length.
        len: usize,
        /// Required length.
        expected: usize,
    },
    /// An id is not valid hex.
    #[error("{key} is not valid hex")]
    InvalidHex {
        /// Field key.
        key: &'static str,
    },
    /// The line is not a JSON object.
    #[error("malformed log line: {0}")]
    Json(String),
}

/// Encodes a typed record.
pub fn encode(record: &Record) -> Result<LogRecord, EncodeError> {
    let mut builder = Builder::default();
    builder.level(record.level.as_str());
    builder.ts(unix_seconds(record.time));
    if let Some(caller) = &record.caller {
        builder.caller(caller.clone());
    }
    builder.msg(record.message.to_string());
    for field in record.fields.iter().filter(|f| !is_header_key(&f.key)) {
        builder.field(&field.key, &field.value);
    }
    builder.finish()
}

/// Encodes one JSON log line.
pub fn encode_json(line: &[u8]) -> Result<LogRecord, EncodeError> {
    let mut de = serde_json::Deserializer::from_slice(line);
    let builder = de
        .deserialize_map(LineVisitor)
        .map_err(|err| EncodeError::Json(err.to_string()))?;
    de.end().map_err(|err| EncodeError::Json(err.to_string()))?;
    builder.finish()
}

/// Accumulates one OTLP record.
#[derive(Debug, Default)]
struct Builder {
    record: LogRecord,
    line: Option<KeyValue>,
    attributes: Vec<KeyValue>,
    error: Option<EncodeError>,
}

impl Builder {
    fn level(&mut self, level: &str) {
        self.record.severity_number = level
            .parse::<Level>()
            .map(|level| level.severity_number())
            .unwrap_or(SeverityNumber::Unspecified) as i32;
        self.record.severity_text = level.to_string();
    }

    fn ts(&mut self, seconds: f64) {
        let nanos = seconds_to_nanos(seconds);
        self.record.time_unix_nano = nanos;
        self.record.observed_time_unix_nano = nanos;
    }

    fn msg(&mut self, msg: String) {
        self.record.body = Some(AnyValue {
            value: Some(any_value::Value::StringValue(msg)),
        });
    }

    fn caller(&mut self, caller: String) {
        self.line = Some(string_attribute(semconv::LOG_LINE, caller));
    }

    fn field(&mut self, key: &str, value: &FieldValue) {
        match key {
            TRACE_ID_KEY => self.trace_id(value),
            SPAN_ID_KEY => self.span_id(value),
            SAMPLED_KEY => match sampled(value) {
                Some(sampled) => {
                    if sampled {
                        self.record.flags |= SAMPLED_FLAG;
                    }
                    self.attributes.push(bool_attribute(SAMPLED_KEY, sampled));
                }
                None => self.attributes.push(string_attribute(key, value.to_text())),
            },
            _ => self.attributes.push(string_attribute(key, value.to_text())),
        }
    }

    fn trace_id(&mut self, value: &FieldValue) {
        match decode_id(TRACE_ID_KEY, value, TRACE_ID_LEN) {
            Ok(id) => self.record.trace_id = id,
            Err(err) => self.fail(err),
        }
    }

    fn span_id(&mut self, value: &FieldValue) {
        match decode_id(SPAN_ID_KEY, value, SPAN_ID_LEN) {
            Ok(id) => self.record.span_id = id,
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: EncodeError) {
        self.error.get_or_insert(err);
    }

    fn finish(mut self) -> Result<LogRecord, EncodeError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.record.attributes = self.line.into_iter().chain(self.attributes).collect();
        Ok(self.record)
    }
}

fn sampled(value: &FieldValue) -> Option<bool> {
    match value {
        FieldValue::Bool(b) => Some(*b),
        FieldValue::String(s) => match s.as_ref() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn decode_id(key: &'static str, value: &FieldValue, expected: usize) -> Result<Vec<u8>, EncodeError> {
    let FieldValue::String(hex) = value else {
        return Err(EncodeError::InvalidHex { key });
    };
    let bytes = const_hex::decode(hex.as_bytes()).map_err(|_| EncodeError::InvalidHex { key })?;
    if bytes.is_empty() || bytes.len() == expected {
        Ok(bytes)
    } else {
        Err(EncodeError::InvalidIdLength {
            key,
            len: bytes.len(),
            expected,
        })
    }
}

fn json_field(value: serde_json::Value) -> FieldValue {
    match value {
        serde_json::Value::String(s) => FieldValue::from(s),
        serde_json::Value::Bool(b) => FieldValue::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                FieldValue::I64(i)
            } else if let Some(u) = n.as_u64() {
                FieldValue::U64(u)
            } else {
                FieldValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        other => FieldValue::from(other.to_string()),
    }
}

struct LineVisitor;

impl<'de> Visitor<'de> for LineVisitor {
    type Value = Builder;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON log object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Builder, A::Error> {
        let mut builder = Builder::default();
        let mut seen = [false; HEADER_KEYS.len()];
        while let Some(key) = map.next_key::<String>()? {
            if let Some(index) = HEADER_KEYS.iter().position(|k| *k == key) {
                if std::mem::replace(&mut seen[index], true) {
                    map.next_value::<IgnoredAny>()?;
                    continue;
                }
            }
            match key.as_str() {
                "level" => builder.level(&map.next_value::<String>()?),
                "ts" => builder.ts(map.next_value::<f64>()?),
                "msg" => builder.msg(map.next_value::<String>()?),
                "caller" => builder.caller(map.next_value::<String>()?),
                _ => {
                    let value = map.next_value::<serde_json::Value>()?;
                    builder.field(&key, &json_field(value));
                }
            }
        }
        Ok(builder)
    }
}
