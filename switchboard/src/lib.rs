//! Switchboard — a message bus with two interaction styles over a
//! pluggable transport: RPC calls returning a single result, and
//! fire-and-forget events delivered to any number of subscribers.
//!
//! This facade crate re-exports the Switchboard sub-crates through a single
//! dependency. Import everything you need with:
//!
//! ```ignore
//! use switchboard::prelude::*;
//! ```
//!
//! # Feature flags
//!
//! | Feature  | Default | Crate                |
//! |----------|---------|----------------------|
//! | `memory` | **yes** | `switchboard-memory` |
//!
//! The `memory` feature pulls in the in-memory transport backend used for
//! tests and local development. Broker-backed transports live in their own
//! crates and implement the contracts in
//! [`switchboard_core::transport`].

pub use switchboard_core::*;

#[cfg(feature = "memory")]
pub use switchboard_memory;

#[cfg(feature = "memory")]
pub use switchboard_memory::{MemoryEventTransport, MemoryResultTransport, MemoryRpcTransport};

/// Unified prelude — import everything with `use switchboard::prelude::*`.
pub mod prelude {
    pub use switchboard_core::prelude::*;

    #[cfg(feature = "memory")]
    pub use switchboard_memory::{
        MemoryEventTransport, MemoryResultTransport, MemoryRpcTransport,
    };
}
