//! In-memory transport backend for the Switchboard message bus.
//!
//! Implements the core transport contracts against process-local queues:
//!
//! - [`MemoryRpcTransport`] — request queue with per-surface filtering
//! - [`MemoryResultTransport`] — result slots addressed by `rpc_id`
//! - [`MemoryEventTransport`] — event stream with a send log
//!
//! Batches are capped and carry a redelivery guard in their ack token: a
//! batch dropped without acknowledgement returns to its queue, which makes
//! the bus's at-least-once behavior observable entirely in-process. That
//! makes these transports the natural backend for tests and local
//! development; they make no attempt at durability.

mod event;
mod queue;
mod result;
mod rpc;

pub use event::MemoryEventTransport;
pub use result::MemoryResultTransport;
pub use rpc::MemoryRpcTransport;
