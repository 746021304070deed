//! In-memory RPC transport.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use switchboard_core::error::BusError;
use switchboard_core::message::{RpcMessage, WireDict, WireMessage};
use switchboard_core::transport::{AckToken, RpcTransport, TransportOptions};

use crate::queue::DictQueue;

const DEFAULT_BATCH_LIMIT: usize = 16;

/// Queue-backed RPC transport for tests and local development.
///
/// `fetch_rpcs` yields only requests addressed to the surfaces passed in,
/// leaving the rest queued. Batches behave like the event transport's: an
/// ack token dropped un-acked pushes its requests back for redelivery.
pub struct MemoryRpcTransport {
    queue: DictQueue,
    calls: Mutex<Vec<RpcMessage>>,
}

impl MemoryRpcTransport {
    pub fn new() -> Self {
        Self::with_batch_limit(DEFAULT_BATCH_LIMIT)
    }

    /// Cap the number of requests handed out per fetch.
    pub fn with_batch_limit(batch_limit: usize) -> Self {
        Self {
            queue: DictQueue::new(batch_limit.max(1)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every request accepted by `call_rpc`, in order.
    pub fn calls(&self) -> Vec<RpcMessage> {
        self.calls.lock().unwrap().clone()
    }

    /// Inject a well-formed request as if a remote caller had published it.
    pub fn inject(&self, request: RpcMessage) {
        self.queue.push(request.to_dict());
    }

    /// Push a raw wire dict straight onto the queue, bypassing validation.
    pub fn inject_raw(&self, dict: WireDict) {
        self.queue.push(dict);
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    pub fn redelivered_batches(&self) -> usize {
        self.queue.redelivered_batches()
    }
}

impl Default for MemoryRpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests with an unreadable `api_name` are drained (and then dropped at
/// decode time with a log entry) rather than left to clog the queue.
fn addressed_to(dict: &WireDict, api_names: &[String]) -> bool {
    match dict.get("api_name").and_then(Value::as_str) {
        Some(api_name) => api_names.iter().any(|name| name == api_name),
        None => true,
    }
}

#[async_trait]
impl RpcTransport for MemoryRpcTransport {
    async fn call_rpc(
        &self,
        request: &RpcMessage,
        _options: &TransportOptions,
    ) -> Result<(), BusError> {
        self.calls.lock().unwrap().push(request.clone());
        self.queue.push(request.to_dict());
        debug!(call = %request.canonical_name(), rpc_id = %request.rpc_id, "rpc request queued");
        Ok(())
    }

    async fn fetch_rpcs(
        &self,
        api_names: &[String],
    ) -> Result<(Vec<RpcMessage>, AckToken), BusError> {
        let raw = self
            .queue
            .fetch_matching(|dict| addressed_to(dict, api_names))
            .await;
        let mut requests = Vec::with_capacity(raw.len());
        for dict in &raw {
            match RpcMessage::from_dict(dict) {
                Ok(request) => requests.push(request),
                Err(error) => warn!(%error, "dropping undecodable rpc envelope"),
            }
        }
        Ok((requests, self.queue.in_flight_token(raw)))
    }

    async fn consumption_complete(&self, token: AckToken) -> Result<(), BusError> {
        self.queue.complete(token)
    }
}
