//! Switchboard core — the message-handling pipeline of the Switchboard bus.
//!
//! Two interaction styles over a pluggable transport:
//!
//! - **RPC**: one caller, one callee, one result, correlated by `rpc_id`.
//! - **Events**: fire-and-forget emissions delivered to zero or more
//!   subscribers, grouped by listener-group key.
//!
//! Operations are addressed `<api>.<member>`, where the `api` is a
//! registered [service surface](crate::api::Api) and the member is a
//! procedure or an event declaration. Transports plug in through the
//! contracts in [`transport`]; the [consumption context](crate::consumption)
//! turns their fetch/acknowledge pairs into at-least-once delivery.
//!
//! ```ignore
//! use switchboard_core::prelude::*;
//!
//! let api = Api::builder("example.test")
//!     .event("my_event", ["f"])
//!     .procedure("my_method", |_kwargs| async { Ok("value".into()) })
//!     .build()?;
//!
//! let bus = Bus::builder()
//!     .api(api)
//!     .rpc_transport(rpc)
//!     .result_transport(result)
//!     .event_transport(event)
//!     .plugin(MetricsPlugin::new())
//!     .build()?;
//!
//! let value = bus.rpc("example.test", "my_method").kwarg("f", 123).call().await?;
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod consumption;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod plugin;
pub mod prelude;
pub mod registry;
pub mod transport;

pub use api::{Api, ApiBuilder, BoxFuture, EventDecl};
pub use client::{Bus, BusBuilder, EventCallback, EventFire, ListenerHandle, RpcCall};
pub use config::{BusConfig, ConfigError};
pub use consumption::{Batch, BatchSource, Consumption};
pub use dispatch::{dispatch_rpc, Dispatch};
pub use error::{render_trace, BusError, HandlerError, SuddenDeath};
pub use logging::init_tracing;
pub use message::{
    new_rpc_id, EventMessage, Kwargs, ResultMessage, RpcMessage, WireDict, WireMessage,
    KWARG_PREFIX,
};
pub use metrics::{MetricsPlugin, METRICS_API_NAME};
pub use plugin::{BusPlugin, HookContext, PluginSet};
pub use registry::ApiRegistry;
pub use transport::{
    AckToken, EventTransport, ListenerGroupKey, ResultTransport, RpcTransport, TransportOptions,
};
