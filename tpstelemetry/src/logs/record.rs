use super::Level;
use std::borrow::Cow;
use std::time::SystemTime;

/// Field key carrying the trace id as lower-case hex.
pub const TRACE_ID_KEY: &str = "traceID";
/// Field key carrying the span id as lower-case hex.
pub const SPAN_ID_KEY: &str = "spanID";
/// Field key carrying whether the trace is sampled.
pub const SAMPLED_KEY: &str = "sampled";
/// Keys written by the record header. Fields using them are never emitted.
pub const HEADER_KEYS: [&str; 4] = ["level", "ts", "caller", "msg"];

pub(crate) fn is_header_key(key: &str) -> bool {
    HEADER_KEYS.contains(&key)
}

/// Typed value of a structured log field.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Text.
    String(Cow<'static, str>),
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    I64(i64),
    /// Unsigned integer.
    U64(u64),
    /// Float.
    F64(f64),
}

impl From<&'static str> for FieldValue {
    fn from(s: &'static str) -> Self {
        FieldValue::String(Cow::Borrowed(s))
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(Cow::Owned(s))
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::I64(i)
    }
}

impl From<u64> for FieldValue {
    fn from(u: u64) -> Self {
        FieldValue::U64(u)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::F64(f)
    }
}

impl FieldValue {
    /// Text form used for OTLP string attributes. Numbers are written the way
    /// a JSON encoder writes them, so both encoders agree.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::String(s) => s.to_string(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::I64(i) => i.to_string(),
            FieldValue::U64(u) => u.to_string(),
            FieldValue::F64(f) => json_number(*f),
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::String(s) => serde_json::Value::String(s.to_string()),
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::I64(i) => serde_json::Value::from(*i),
            FieldValue::U64(u) => serde_json::Value::from(*u),
            FieldValue::F64(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(f.to_string())),
        }
    }
}

fn json_number(f: f64) -> String {
    serde_json::Number::from_f64(f)
        .map(|n| n.to_string())
        .unwrap_or_else(|| f.to_string())
}

/// One key/value pair of a log call.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    /// Key.
    pub key: Cow<'static, str>,
    /// Value.
    pub value: FieldValue,
}

impl Field {
    /// Creates a field.
    pub fn new(key: impl Into<Cow<'static, str>>, value: impl Into<FieldValue>) -> Self {
        Field {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A structured log entry as produced by a log call.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    /// Severity.
    pub level: Level,
    /// When the call happened.
    pub time: SystemTime,
    /// Message.
    pub message: Cow<'static, str>,
    /// Call site as `file:line`.
    pub caller: Option<String>,
    /// Fields in call order. `traceID`, `spanID` and `sampled` link the record
    /// to a trace.
    pub fields: Vec<Field>,
}

impl Record {
    /// A record stamped with the current time.
    pub fn new(level: Level, message: impl Into<Cow<'static, str>>) -> Self {
        Record {
            level,
            time: SystemTime::now(),
            message: message.into(),
            caller: None,
            fields: Vec::new(),
        }
    }

    /// Sets the call site.
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Sets the timestamp.
    pub fn with_time(mut self, time: SystemTime) -> Self {
        self.time = time;
        self
    }

    /// Appends a field.
    pub fn with_field(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<FieldValue>) -> Self {
        self.fields.push(Field::new(key, value));
        self
    }

    /// Appends the trace correlation fields.
    pub fn with_trace(
        self,
        trace_id: opentelemetry::trace::TraceId,
        span_id: opentelemetry::trace::SpanId,
        sampled: bool,
    ) -> Self {
        self.with_field(TRACE_ID_KEY, trace_id.to_string())
            .with_field(SPAN_ID_KEY, span_id.to_string())
            .with_field(SAMPLED_KEY, sampled)
    }

    /// Value of the first field named `key`.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.key == key)
            .map(|field| &field.value)
    }

    /// Writes the record as one JSON line in the layout of a zap JSON encoder:
    /// `level`, `ts`, `caller`, `msg`, then the fields.
    pub fn to_json_line(&self) -> String {
        let mut line = String::with_capacity(128);
        line.push('{');
        push_pair(&mut line, "level", &serde_json::Value::from(self.level.as_str()));
        line.push(',');
        push_pair(&mut line, "ts", &serde_json::Value::from(unix_seconds(self.time)));
        if let Some(caller) = &self.caller {
            line.push(',');
            push_pair(&mut line, "caller", &serde_json::Value::from(caller.as_str()));
        }
        line.push(',');
        push_pair(&mut line, "msg", &serde_json::Value::from(self.message.as_ref()));
        for field in self.fields.iter().filter(|f| !is_header_key(&f.key)) {
            line.push(',');
            push_pair(&mut line, &field.key, &field.value.to_json());
        }
        line.push('}');
        line
    }
}

fn push_pair(line: &mut String, key: &str, value: &serde_json::Value) {
    line.push_str(&serde_json::Value::from(key).to_string());
    line.push(':');
    line.push_str(&value.to_string());
}

/// Seconds since the epoch as a float, the precision a JSON `ts` carries.
pub(crate) fn unix_seconds(time: SystemTime) -> f64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Converts float seconds to nanoseconds.
pub(crate) fn seconds_to_nanos(seconds: f64) -> u64 {
    if seconds.is_finite() && seconds > 0.0 {
        (seconds * 1e9) as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn json_line_layout() {
        let record = Record::new(Level::Warn, "disk \"full\"")
            .with_time(SystemTime::UNIX_EPOCH + Duration::from_millis(1_500))
            .with_caller("server.rs:42")
            .with_field("attempt", 3_i64)
            .with_field("ratio", 0.5);
        assert_eq!(
            record.to_json_line(),
            r#"{"level":"warn","ts":1.5,"caller":"server.rs:42","msg":"disk \"full\"","attempt":3,"ratio":0.5}"#
        );
    }

    #[test]
    fn header_keys_are_not_repeated_by_fields() {
        let record = Record::new(Level::Info, "real")
            .with_time(SystemTime::UNIX_EPOCH)
            .with_field("msg", "fake")
            .with_field("level", "fatal")
            .with_field("user", "u-1");
        assert_eq!(
            record.to_json_line(),
            r#"{"level":"info","ts":0.0,"msg":"real","user":"u-1"}"#
        );
    }

    #[test]
    fn text_form_of_numbers_matches_json() {
        assert_eq!(FieldValue::F64(2.0).to_text(), "2.0");
        assert_eq!(FieldValue::I64(-7).to_text(), "-7");
        assert_eq!(FieldValue::Bool(true).to_text(), "true");
    }

    #[test]
    fn seconds_round_down_to_nanos() {
        assert_eq!(seconds_to_nanos(1.5), 1_500_000_000);
        assert_eq!(seconds_to_nanos(-1.0), 0);
        assert_eq!(seconds_to_nanos(f64::NAN), 0);
    }
}
