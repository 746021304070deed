//! In-memory result transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use switchboard_core::error::BusError;
use switchboard_core::message::{ResultMessage, RpcMessage, WireDict, WireMessage};
use switchboard_core::transport::{ResultTransport, TransportOptions};

/// Slot-per-return-path result transport.
///
/// Return paths derive from the request's `rpc_id`, so both ends agree on
/// the address without coordination. Each slot buffers deliveries, which
/// makes duplicate results — the normal by-product of at-least-once RPC
/// serving — harmless: the caller takes the first, later copies land in a
/// slot nobody reads.
pub struct MemoryResultTransport {
    slots: DashMap<String, Arc<ResultSlot>>,
}

struct ResultSlot {
    results: Mutex<VecDeque<WireDict>>,
    notify: Notify,
}

impl MemoryResultTransport {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    fn slot(&self, return_path: &str) -> Arc<ResultSlot> {
        self.slots
            .entry(return_path.to_string())
            .or_insert_with(|| {
                Arc::new(ResultSlot {
                    results: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            })
            .value()
            .clone()
    }

    /// Return paths with undelivered results (orphans included).
    pub fn open_paths(&self) -> usize {
        self.slots.len()
    }
}

impl Default for MemoryResultTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultTransport for MemoryResultTransport {
    fn get_return_path(&self, request: &RpcMessage) -> String {
        format!("memory://result/{}", request.rpc_id)
    }

    async fn send_result(
        &self,
        request: &RpcMessage,
        result: &ResultMessage,
        return_path: &str,
    ) -> Result<(), BusError> {
        if return_path.is_empty() {
            debug!(rpc_id = %request.rpc_id, "request carries no return path; dropping result");
            return Ok(());
        }
        let slot = self.slot(return_path);
        slot.results.lock().unwrap().push_back(result.to_dict());
        slot.notify.notify_one();
        Ok(())
    }

    async fn receive_result(
        &self,
        request: &RpcMessage,
        return_path: &str,
        options: &TransportOptions,
    ) -> Result<ResultMessage, BusError> {
        let slot = self.slot(return_path);
        let wait = async {
            loop {
                let delivered = slot.results.lock().unwrap().pop_front();
                if let Some(dict) = delivered {
                    return dict;
                }
                slot.notify.notified().await;
            }
        };

        let dict = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                BusError::RpcTimeout {
                    rpc_id: request.rpc_id.clone(),
                    canonical_name: request.canonical_name(),
                }
            })?,
            None => wait.await,
        };

        // The caller has its result; the path is done. Stragglers re-create
        // a slot that nobody reads.
        self.slots.remove(return_path);
        ResultMessage::from_dict(&dict)
    }
}
