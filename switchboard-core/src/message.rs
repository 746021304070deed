//! Message envelopes: RPC request, RPC result, and event.
//!
//! Every envelope round-trips through a canonical dict form — a string-keyed
//! `serde_json` map in which keyword arguments are flattened as `kw:<name>`
//! entries. The `kw:` prefix is reserved, which leaves every other top-level
//! key available for envelope metadata without collision. The envelope
//! imposes no schema on argument values; they are carried as raw
//! `serde_json::Value`s.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{render_trace, BusError};

/// Keyword arguments carried by a request or an event.
pub type Kwargs = BTreeMap<String, Value>;

/// The canonical dict form all envelopes flatten to.
pub type WireDict = Map<String, Value>;

/// Reserved top-level key prefix marking a keyword argument on the wire.
pub const KWARG_PREFIX: &str = "kw:";

/// Generate a fresh correlation id: URL-safe unpadded base64 of a 16-byte
/// time-ordered identifier.
pub fn new_rpc_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::now_v7().as_bytes())
}

/// Total `to_dict`/`from_dict` round-trip implemented by every envelope.
pub trait WireMessage: Sized {
    /// Envelope name used in validation errors.
    const MESSAGE_TYPE: &'static str;

    fn to_dict(&self) -> WireDict;

    /// Decode from the canonical dict form, validating required keys and
    /// non-empty values. Fails with [`BusError::InvalidRpcMessage`] naming
    /// the offending key.
    fn from_dict(dict: &WireDict) -> Result<Self, BusError>;
}

fn found_keys(dict: &WireDict) -> String {
    dict.keys().cloned().collect::<Vec<_>>().join(", ")
}

fn require_string(
    dict: &WireDict,
    message_type: &'static str,
    key: &str,
) -> Result<String, BusError> {
    match dict.get(key) {
        None => Err(BusError::InvalidRpcMessage {
            message_type,
            key: key.to_string(),
            detail: format!("is missing (found keys: {})", found_keys(dict)),
        }),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(BusError::InvalidRpcMessage {
            message_type,
            key: key.to_string(),
            detail: "is present but empty".to_string(),
        }),
        Some(other) => Err(BusError::InvalidRpcMessage {
            message_type,
            key: key.to_string(),
            detail: format!("must be a string, got {other}"),
        }),
    }
}

/// Like [`require_string`], but an empty value is acceptable; only the key
/// itself is mandatory.
fn require_string_allow_empty(
    dict: &WireDict,
    message_type: &'static str,
    key: &str,
) -> Result<String, BusError> {
    match dict.get(key) {
        None => Err(BusError::InvalidRpcMessage {
            message_type,
            key: key.to_string(),
            detail: format!("is missing (found keys: {})", found_keys(dict)),
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(BusError::InvalidRpcMessage {
            message_type,
            key: key.to_string(),
            detail: format!("must be a string, got {other}"),
        }),
    }
}

fn collect_kwargs(dict: &WireDict) -> Kwargs {
    dict.iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(KWARG_PREFIX)
                .map(|name| (name.to_string(), value.clone()))
        })
        .collect()
}

fn insert_kwargs(dict: &mut WireDict, kwargs: &Kwargs) {
    for (name, value) in kwargs {
        dict.insert(format!("{KWARG_PREFIX}{name}"), value.clone());
    }
}

fn format_kwargs(kwargs: &Kwargs, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for (name, value) in kwargs {
        if !first {
            write!(f, ", ")?;
        }
        write!(f, "{name}={value}")?;
        first = false;
    }
    Ok(())
}

// ── RPC request ─────────────────────────────────────────────────────────

/// An RPC request envelope.
///
/// `rpc_id`, `api_name` and `procedure_name` are non-empty on any envelope
/// that may be transmitted. `return_path` is produced by the result
/// transport and may be empty on an envelope that has not been routed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    pub rpc_id: String,
    pub api_name: String,
    pub procedure_name: String,
    pub kwargs: Kwargs,
    pub return_path: String,
}

impl RpcMessage {
    /// Build a request with a freshly generated `rpc_id`.
    pub fn new(
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self::with_id(new_rpc_id(), api_name, procedure_name, kwargs)
    }

    /// Build a request with a caller-supplied `rpc_id`.
    pub fn with_id(
        rpc_id: impl Into<String>,
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs,
            return_path: String::new(),
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.procedure_name)
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.canonical_name())?;
        format_kwargs(&self.kwargs, f)?;
        write!(f, ")")
    }
}

impl WireMessage for RpcMessage {
    const MESSAGE_TYPE: &'static str = "RpcMessage";

    fn to_dict(&self) -> WireDict {
        let mut dict = WireDict::new();
        dict.insert("rpc_id".into(), Value::String(self.rpc_id.clone()));
        dict.insert("api_name".into(), Value::String(self.api_name.clone()));
        dict.insert(
            "procedure_name".into(),
            Value::String(self.procedure_name.clone()),
        );
        dict.insert(
            "return_path".into(),
            Value::String(self.return_path.clone()),
        );
        insert_kwargs(&mut dict, &self.kwargs);
        dict
    }

    fn from_dict(dict: &WireDict) -> Result<Self, BusError> {
        let rpc_id = require_string(dict, Self::MESSAGE_TYPE, "rpc_id")?;
        let api_name = require_string(dict, Self::MESSAGE_TYPE, "api_name")?;
        let procedure_name = require_string(dict, Self::MESSAGE_TYPE, "procedure_name")?;
        let return_path = require_string_allow_empty(dict, Self::MESSAGE_TYPE, "return_path")?;
        let mut message = Self::with_id(rpc_id, api_name, procedure_name, collect_kwargs(dict));
        message.return_path = return_path;
        Ok(message)
    }
}

// ── RPC result ──────────────────────────────────────────────────────────

/// An RPC result envelope, correlated with its request by `rpc_id`.
///
/// Carries either a success value, or a stringified error plus a
/// human-readable trace. A result built from a failure has `error` forced
/// true and the trace captured from the failure's `source()` chain; a result
/// assembled field-by-field carries whatever `error` flag the caller
/// supplies.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMessage {
    pub rpc_id: String,
    pub result: Value,
    pub error: bool,
    pub trace: Option<String>,
}

impl ResultMessage {
    pub fn success(rpc_id: impl Into<String>, result: Value) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            result,
            error: false,
            trace: None,
        }
    }

    pub fn from_failure(rpc_id: impl Into<String>, failure: &(dyn StdError + 'static)) -> Self {
        Self {
            rpc_id: rpc_id.into(),
            result: Value::String(failure.to_string()),
            error: true,
            trace: Some(render_trace(failure)),
        }
    }

    fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ResultMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error {
            write!(f, "error: {}", self.result_text())
        } else {
            write!(f, "{}", self.result)
        }
    }
}

impl WireMessage for ResultMessage {
    const MESSAGE_TYPE: &'static str = "ResultMessage";

    fn to_dict(&self) -> WireDict {
        let mut dict = WireDict::new();
        dict.insert("rpc_id".into(), Value::String(self.rpc_id.clone()));
        dict.insert("error".into(), Value::Bool(self.error));
        if self.error {
            // The wire carries a stringified representation on failure.
            dict.insert("result".into(), Value::String(self.result_text()));
            dict.insert(
                "trace".into(),
                Value::String(self.trace.clone().unwrap_or_default()),
            );
        } else {
            dict.insert("result".into(), self.result.clone());
        }
        dict
    }

    fn from_dict(dict: &WireDict) -> Result<Self, BusError> {
        let rpc_id = require_string(dict, Self::MESSAGE_TYPE, "rpc_id")?;
        let result = dict
            .get("result")
            .cloned()
            .ok_or_else(|| BusError::InvalidRpcMessage {
                message_type: Self::MESSAGE_TYPE,
                key: "result".to_string(),
                detail: format!("is missing (found keys: {})", found_keys(dict)),
            })?;
        let error = match dict.get("error") {
            Some(Value::Bool(flag)) => *flag,
            Some(other) => {
                return Err(BusError::InvalidRpcMessage {
                    message_type: Self::MESSAGE_TYPE,
                    key: "error".to_string(),
                    detail: format!("must be a boolean, got {other}"),
                })
            }
            None => {
                return Err(BusError::InvalidRpcMessage {
                    message_type: Self::MESSAGE_TYPE,
                    key: "error".to_string(),
                    detail: format!("is missing (found keys: {})", found_keys(dict)),
                })
            }
        };
        let trace = if error {
            Some(require_string(dict, Self::MESSAGE_TYPE, "trace")?)
        } else {
            None
        };
        Ok(Self {
            rpc_id,
            result,
            error,
            trace,
        })
    }
}

// ── Event ───────────────────────────────────────────────────────────────

/// A fire-and-forget event envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    pub api_name: String,
    pub event_name: String,
    pub kwargs: Kwargs,
}

impl EventMessage {
    pub fn new(
        api_name: impl Into<String>,
        event_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }
}

impl fmt::Display for EventMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.canonical_name())?;
        format_kwargs(&self.kwargs, f)?;
        write!(f, ")")
    }
}

impl WireMessage for EventMessage {
    const MESSAGE_TYPE: &'static str = "EventMessage";

    fn to_dict(&self) -> WireDict {
        let mut dict = WireDict::new();
        dict.insert("api_name".into(), Value::String(self.api_name.clone()));
        dict.insert("event_name".into(), Value::String(self.event_name.clone()));
        insert_kwargs(&mut dict, &self.kwargs);
        dict
    }

    fn from_dict(dict: &WireDict) -> Result<Self, BusError> {
        let api_name = require_string(dict, Self::MESSAGE_TYPE, "api_name")?;
        let event_name = require_string(dict, Self::MESSAGE_TYPE, "event_name")?;
        Ok(Self::new(api_name, event_name, collect_kwargs(dict)))
    }
}
