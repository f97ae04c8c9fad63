use opentelemetry_proto::tonic::logs::v1::SeverityNumber;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Log severity, ordered from least to most severe.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Level {
    /// Verbose diagnostics.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Something unexpected that the program handled.
    Warn,
    /// An operation failed.
    Error,
    /// A failure that panics in development builds.
    DPanic,
    /// A failure after which the program panics.
    Panic,
    /// A failure after which the program exits.
    Fatal,
}

/// Number of distinct levels.
pub(crate) const LEVELS: usize = 7;

impl Level {
    /// Lower-case name as written in the `level` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::DPanic => "dpanic",
            Level::Panic => "panic",
            Level::Fatal => "fatal",
        }
    }

    /// OTLP severity number.
    pub fn severity_number(&self) -> SeverityNumber {
        match self {
            Level::Debug => SeverityNumber::Debug,
            Level::Info => SeverityNumber::Info,
            Level::Warn => SeverityNumber::Warn,
            Level::Error => SeverityNumber::Error,
            Level::DPanic => SeverityNumber::Error2,
            Level::Panic => SeverityNumber::Error3,
            Level::Fatal => SeverityNumber::Fatal,
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level {0:?}")]
pub struct ParseLevelError(String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "dpanic" => Ok(Level::DPanic),
            "panic" => Ok(Level::Panic),
            "fatal" => Ok(Level::Fatal),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Level {
    type Error = ParseLevelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<&tracing_core::Level> for Level {
    fn from(level: &tracing_core::Level) -> Self {
        match *level {
            tracing_core::Level::TRACE | tracing_core::Level::DEBUG => Level::Debug,
            tracing_core::Level::INFO => Level::Info,
            tracing_core::Level::WARN => Level::Warn,
            tracing_core::Level::ERROR => Level::Error,
        }
    }
}
