//! The built-in metrics plugin.
//!
//! Maps the plugin hook surface onto `internal.metrics.*` events so that
//! observability tooling can watch bus activity as ordinary bus events.
//! Every payload carries `timestamp` (float Unix seconds) and
//! `process_name`; RPC payloads additionally carry `rpc_id`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::api::Api;
use crate::error::BusError;
use crate::message::{EventMessage, Kwargs, ResultMessage, RpcMessage};
use crate::plugin::{BusPlugin, HookContext};

/// Bus address of the surface the metrics plugin emits on.
pub const METRICS_API_NAME: &str = "internal.metrics";

/// Emits one `internal.metrics` event per bus operation:
///
/// | hook | event |
/// |---|---|
/// | `before_rpc_call` | `rpc_call_sent` |
/// | `after_rpc_call` | `rpc_response_received` |
/// | `before_rpc_execution` | `rpc_call_received` |
/// | `after_rpc_execution` | `rpc_response_sent` |
/// | `after_event_sent` | `event_fired` |
/// | `before_event_execution` | `event_received` |
/// | `after_event_execution` | `event_processed` |
#[derive(Debug, Default)]
pub struct MetricsPlugin;

impl MetricsPlugin {
    pub fn new() -> Self {
        Self
    }

    async fn emit(
        &self,
        ctx: &HookContext<'_>,
        event_name: &str,
        mut kwargs: Kwargs,
    ) -> Result<(), BusError> {
        kwargs.insert("timestamp".into(), Value::from(unix_timestamp()));
        kwargs.insert(
            "process_name".into(),
            Value::String(ctx.process_name().to_string()),
        );
        ctx.emit_internal(EventMessage::new(METRICS_API_NAME, event_name, kwargs))
            .await
    }

    fn rpc_fields(request: &RpcMessage) -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("rpc_id".into(), Value::String(request.rpc_id.clone()));
        kwargs.insert("api_name".into(), Value::String(request.api_name.clone()));
        kwargs.insert(
            "procedure_name".into(),
            Value::String(request.procedure_name.clone()),
        );
        kwargs
    }

    fn event_fields(event: &EventMessage) -> Kwargs {
        let mut kwargs = Kwargs::new();
        kwargs.insert("api_name".into(), Value::String(event.api_name.clone()));
        kwargs.insert("event_name".into(), Value::String(event.event_name.clone()));
        kwargs.insert("kwargs".into(), nested_kwargs(&event.kwargs));
        kwargs
    }
}

fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn nested_kwargs(kwargs: &Kwargs) -> Value {
    Value::Object(
        kwargs
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    )
}

#[async_trait]
impl BusPlugin for MetricsPlugin {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn apis(&self) -> Vec<Api> {
        let rpc_args = [
            "timestamp",
            "process_name",
            "rpc_id",
            "api_name",
            "procedure_name",
        ];
        let event_args = [
            "timestamp",
            "process_name",
            "api_name",
            "event_name",
            "kwargs",
        ];
        let api = Api::builder(METRICS_API_NAME)
            .internal(true)
            .event("rpc_call_sent", rpc_args.iter().chain(&["kwargs"]).copied())
            .event("rpc_response_received", rpc_args)
            .event("rpc_call_received", rpc_args)
            .event("rpc_response_sent", rpc_args.iter().chain(&["result"]).copied())
            .event("event_fired", event_args)
            .event("event_received", event_args)
            .event("event_processed", event_args)
            .build()
            .expect("the internal.metrics surface definition is static and valid");
        vec![api]
    }

    async fn before_rpc_call(
        &self,
        request: &RpcMessage,
        ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        let mut kwargs = Self::rpc_fields(request);
        kwargs.insert("kwargs".into(), nested_kwargs(&request.kwargs));
        self.emit(ctx, "rpc_call_sent", kwargs).await
    }

    async fn after_rpc_call(
        &self,
        request: &RpcMessage,
        _result: &ResultMessage,
        ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        self.emit(ctx, "rpc_response_received", Self::rpc_fields(request))
            .await
    }

    async fn before_rpc_execution(
        &self,
        request: &RpcMessage,
        ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        self.emit(ctx, "rpc_call_received", Self::rpc_fields(request))
            .await
    }

    async fn after_rpc_execution(
        &self,
        request: &RpcMessage,
        result: &ResultMessage,
        ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        let mut kwargs = Self::rpc_fields(request);
        kwargs.insert("result".into(), result.result.clone());
        self.emit(ctx, "rpc_response_sent", kwargs).await
    }

    async fn after_event_sent(
        &self,
        event: &EventMessage,
        ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        self.emit(ctx, "event_fired", Self::event_fields(event)).await
    }

    async fn before_event_execution(
        &self,
        event: &EventMessage,
        ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        self.emit(ctx, "event_received", Self::event_fields(event))
            .await
    }

    async fn after_event_execution(
        &self,
        event: &EventMessage,
        ctx: &HookContext<'_>,
    ) -> Result<(), BusError> {
        self.emit(ctx, "event_processed", Self::event_fields(event))
            .await
    }
}
