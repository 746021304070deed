//! Error taxonomy for the bus core.
//!
//! Registry and configuration errors are fatal at startup. Everything that
//! happens while serving is converted into wire-level error results or logged
//! and retried — a failing handler must never tear down a consumption loop.

use std::error::Error as StdError;
use std::fmt;

/// Boxed error type returned by procedure and event handlers.
///
/// Handlers may fail with any error type; the bus stringifies the error and
/// captures its `source()` chain when building the wire-level result.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Error type for bus operations.
#[derive(Debug)]
pub enum BusError {
    /// A registry lookup was made for a name that was never registered.
    UnknownApi(String),
    /// An attempt was made to register a surface that was never finished by
    /// its builder.
    InvalidApiRegistryEntry(String),
    /// A surface definition is missing its name, or a name fails the
    /// `<api>.<member>` addressing grammar.
    MisconfiguredApiOptions(String),
    /// The named surface member is not an event declaration.
    EventNotFound { api_name: String, event_name: String },
    /// The named surface member is not a procedure.
    ProcedureNotFound {
        api_name: String,
        procedure_name: String,
    },
    /// An envelope failed `from_dict` validation.
    InvalidRpcMessage {
        message_type: &'static str,
        key: String,
        detail: String,
    },
    /// The result of an RPC call did not arrive within the caller's window.
    RpcTimeout {
        rpc_id: String,
        canonical_name: String,
    },
    /// A transport-level failure, surfaced by the backend.
    Transport(String),
    /// The bus client itself was assembled incompletely.
    Configuration(String),
    /// The error carried in a result envelope, re-raised to the caller.
    RemoteError {
        message: String,
        trace: Option<String>,
    },
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::UnknownApi(name) => write!(
                f,
                "no API named '{name}' is registered; check the name, or register \
                 the surface before using it"
            ),
            BusError::InvalidApiRegistryEntry(detail) => {
                write!(f, "refusing to register surface: {detail}")
            }
            BusError::MisconfiguredApiOptions(detail) => {
                write!(f, "surface options are misconfigured: {detail}")
            }
            BusError::EventNotFound {
                api_name,
                event_name,
            } => write!(f, "no event named '{api_name}.{event_name}' is declared"),
            BusError::ProcedureNotFound {
                api_name,
                procedure_name,
            } => write!(
                f,
                "no procedure named '{api_name}.{procedure_name}' is declared"
            ),
            BusError::InvalidRpcMessage {
                message_type,
                key,
                detail,
            } => write!(f, "invalid {message_type}: key '{key}' {detail}"),
            BusError::RpcTimeout {
                rpc_id,
                canonical_name,
            } => write!(
                f,
                "timed out waiting for the result of {canonical_name} (rpc_id {rpc_id})"
            ),
            BusError::Transport(detail) => write!(f, "transport failure: {detail}"),
            BusError::Configuration(detail) => write!(f, "bus configuration error: {detail}"),
            BusError::RemoteError { message, .. } => write!(f, "remote call failed: {message}"),
        }
    }
}

impl StdError for BusError {}

/// Synthetic handler failure used by tests to simulate a worker dying
/// mid-batch. The serve loops treat it specially: the current batch is
/// abandoned un-acknowledged, so the transport re-delivers it.
#[derive(Debug, Default)]
pub struct SuddenDeath;

impl fmt::Display for SuddenDeath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler died mid-batch")
    }
}

impl StdError for SuddenDeath {}

/// Render a human-readable trace from an error and its `source()` chain.
///
/// Exceptions cannot be transported faithfully; only the stringified message
/// chain survives the wire.
pub fn render_trace(error: &(dyn StdError + 'static)) -> String {
    let mut trace = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str("\ncaused by: ");
        trace.push_str(&cause.to_string());
        source = cause.source();
    }
    trace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(Inner);

    #[derive(Debug)]
    struct Inner;

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "outer failed")
        }
    }

    impl fmt::Display for Inner {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "inner failed")
        }
    }

    impl StdError for Outer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    impl StdError for Inner {}

    #[test]
    fn render_trace_walks_source_chain() {
        let trace = render_trace(&Outer(Inner));
        assert_eq!(trace, "outer failed\ncaused by: inner failed");
    }

    #[test]
    fn display_names_the_offending_key() {
        let err = BusError::InvalidRpcMessage {
            message_type: "RpcMessage",
            key: "rpc_id".into(),
            detail: "is present but empty".into(),
        };
        let text = err.to_string();
        assert!(text.contains("rpc_id"));
        assert!(text.contains("RpcMessage"));
    }

    #[test]
    fn display_names_unknown_api() {
        let text = BusError::UnknownApi("missing.api".into()).to_string();
        assert!(text.contains("missing.api"));
    }
}
