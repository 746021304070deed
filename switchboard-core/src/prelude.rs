//! Switchboard prelude — import everything you need with a single `use`.
//!
//! ```ignore
//! use switchboard_core::prelude::*;
//! ```

pub use crate::api::{Api, ApiBuilder, EventDecl};
pub use crate::client::{Bus, BusBuilder, ListenerHandle};
pub use crate::config::BusConfig;
pub use crate::consumption::{Batch, Consumption};
pub use crate::error::{BusError, HandlerError};
pub use crate::logging::init_tracing;
pub use crate::message::{EventMessage, Kwargs, ResultMessage, RpcMessage, WireMessage};
pub use crate::metrics::MetricsPlugin;
pub use crate::plugin::{BusPlugin, HookContext};
pub use crate::registry::ApiRegistry;
pub use crate::transport::{
    EventTransport, ListenerGroupKey, ResultTransport, RpcTransport, TransportOptions,
};
