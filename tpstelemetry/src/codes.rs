//! # Code classification
//!
//! RPC return codes are classified as success, exception or timeout before
//! they label the RPC metrics. The table is keyed by code; each code has an
//! ordered list of entries optionally scoped to a callee service and/or
//! method. A scoped entry applies to a call to `(S, M)` when its service is
//! `S` or its method is `M`; an unscoped entry applies to every call. Entries
//! are tried in this order:
//!
//! 1. entries with both a service and a method;
//! 2. entries with a service only;
//! 3. entries with a method only;
//! 4. entries with neither;
//! 5. the built-in default: `"0"` and `""` are success, anything else is an
//!    exception.
//!
//! [`CodeMapper::set`] rebuilds the whole table from the given remote entries
//! followed by the local ones and publishes it atomically. Within a rank the
//! first entry wins, so remote entries override local ones.
use crate::remote::Applier;
use crate::error::RemoteError;
use crate::tps_warn;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tpstelemetry_proto::tonic::control::v1::{Code, Operation};

/// Maximum description length in bytes.
pub const MAX_DESCRIPTION_LEN: usize = 32;

/// Outcome class of an RPC code.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    /// The call succeeded.
    Success,
    /// The call failed.
    Exception,
    /// The call timed out.
    Timeout,
}

impl CodeType {
    /// Label value used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeType::Success => "success",
            CodeType::Exception => "exception",
            CodeType::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(CodeType::Success),
            "exception" => Ok(CodeType::Exception),
            "timeout" => Ok(CodeType::Timeout),
            other => Err(format!("unknown code type {other:?}")),
        }
    }
}

/// One configured classification.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CodeEntry {
    /// Code as reported by the framework.
    pub code: String,
    /// Classification.
    #[serde(rename = "type")]
    pub code_type: CodeType,
    /// Short description, legalized on build.
    #[serde(default)]
    pub description: String,
    /// Callee service the entry is limited to, empty for any.
    #[serde(default)]
    pub service: String,
    /// Callee method the entry is limited to, empty for any.
    #[serde(default)]
    pub method: String,
}

impl CodeEntry {
    /// Creates an entry valid for any service and method.
    pub fn new(code: impl Into<String>, code_type: CodeType, description: impl Into<String>) -> Self {
        CodeEntry {
            code: code.into(),
            code_type,
            description: description.into(),
            service: String::new(),
            method: String::new(),
        }
    }

    /// Limits the entry to a callee service.
    pub fn with_service(self, service: impl Into<String>) -> Self {
        CodeEntry {
            service: service.into(),
            ..self
        }
    }

    /// Limits the entry to a callee method.
    pub fn with_method(self, method: impl Into<String>) -> Self {
        CodeEntry {
            method: method.into(),
            ..self
        }
    }

    fn rank(&self) -> u8 {
        match (self.service.is_empty(), self.method.is_empty()) {
            (false, false) => 0,
            (false, true) => 1,
            (true, false) => 2,
            (true, true) => 3,
        }
    }

    fn matches(&self, service: &str, method: &str) -> bool {
        (self.service.is_empty() && self.method.is_empty())
            || (!self.service.is_empty() && self.service == service)
            || (!self.method.is_empty() && self.method == method)
    }
}

impl TryFrom<&Code> for CodeEntry {
    type Error = String;

    fn try_from(code: &Code) -> Result<Self, Self::Error> {
        Ok(CodeEntry {
            code: code.code.clone(),
            code_type: code.r#type.parse()?,
            description: code.description.clone(),
            service: code.service.clone(),
            method: code.method.clone(),
        })
    }
}

/// Result of a lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeClass {
    /// Classification.
    pub code_type: CodeType,
    /// Description, at most [`MAX_DESCRIPTION_LEN`] bytes.
    pub description: Arc<str>,
}

#[derive(Debug, Default)]
struct CodeTable {
    by_code: HashMap<String, Vec<(CodeEntry, CodeClass)>>,
}

impl CodeTable {
    fn build<'a, I: IntoIterator<Item = &'a CodeEntry>>(entries: I) -> Self {
        let mut by_code: HashMap<String, Vec<(CodeEntry, CodeClass)>> = HashMap::new();
        for entry in entries {
            let class = CodeClass {
                code_type: entry.code_type,
                description: Arc::from(legalize_description(entry.description.as_bytes())),
            };
            by_code
                .entry(entry.code.clone())
                .or_default()
                .push((entry.clone(), class));
        }
        for list in by_code.values_mut() {
            list.sort_by_key(|(entry, _)| entry.rank());
        }
        CodeTable { by_code }
    }
}

/// Classifies codes against an atomically replaceable table.
///
/// Clones share the table.
#[derive(Clone)]
pub struct CodeMapper {
    local: Arc<Vec<CodeEntry>>,
    active: Arc<ArcSwap<CodeTable>>,
    success: CodeClass,
    exception: CodeClass,
}

impl fmt::Debug for CodeMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeMapper")
            .field("local", &self.local.len())
            .field("codes", &self.active.load().by_code.len())
            .finish()
    }
}

impl Default for CodeMapper {
    fn default() -> Self {
        CodeMapper::new(Vec::new())
    }
}

impl CodeMapper {
    /// Creates a mapper from locally configured entries.
    pub fn new(local: Vec<CodeEntry>) -> Self {
        let active = CodeTable::build(&local);
        CodeMapper {
            local: Arc::new(local),
            active: Arc::new(ArcSwap::from_pointee(active)),
            success: CodeClass {
                code_type: CodeType::Success,
                description: Arc::from("code=0"),
            },
            exception: CodeClass {
                code_type: CodeType::Exception,
                description: Arc::from("code!=0"),
            },
        }
    }

    /// Classifies `code` returned by `service`/`method`.
    pub fn code_mapping(&self, code: &str, service: &str, method: &str) -> CodeClass {
        let table = self.active.load();
        if let Some(entries) = table.by_code.get(code) {
            if let Some((_, class)) = entries.iter().find(|(e, _)| e.matches(service, method)) {
                return class.clone();
            }
        }
        if code.is_empty() || code == "0" {
            self.success.clone()
        } else {
            self.exception.clone()
        }
    }

    /// Replaces the table with `remote` followed by the local entries.
    pub fn set(&self, remote: &[CodeEntry]) {
        let table = CodeTable::build(remote.iter().chain(self.local.iter()));
        self.active.store(Arc::new(table));
    }
}

impl Applier for CodeMapper {
    fn name(&self) -> &str {
        "codes"
    }

    fn apply(&self, operation: &Operation) -> Result<(), RemoteError> {
        let codes = operation
            .metric
            .as_ref()
            .map(|metric| metric.codes.as_slice())
            .unwrap_or_default();
        let mut remote = Vec::with_capacity(codes.len());
        for code in codes {
            match CodeEntry::try_from(code) {
                Ok(entry) => remote.push(entry),
                Err(reason) => {
                    tps_warn!(name: "CodeMapper.InvalidEntry", code = code.code.clone(), reason = reason);
                }
            }
        }
        self.set(&remote);
        Ok(())
    }
}

/// Cuts `description` to [`MAX_DESCRIPTION_LEN`] bytes and drops whatever is
/// not valid UTF-8, including a character split by the cut.
pub fn legalize_description(description: &[u8]) -> String {
    let mut rest = &description[..description.len().min(MAX_DESCRIPTION_LEN)];
    let mut out = String::with_capacity(rest.len());
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                // valid_up_to guarantees the prefix is UTF-8
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match err.error_len() {
                    Some(len) => rest = &after[len..],
                    None => return out,
                }
            }
        }
    }
}
