//! In-memory event transport.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, warn};

use switchboard_core::error::BusError;
use switchboard_core::message::{EventMessage, WireDict, WireMessage};
use switchboard_core::transport::{AckToken, EventTransport, ListenerGroupKey, TransportOptions};

use crate::queue::DictQueue;

const DEFAULT_BATCH_LIMIT: usize = 16;

/// Queue-backed event transport for tests and local development.
///
/// Events travel in their canonical dict form; envelopes that fail to
/// decode on fetch are dropped with a log entry. A batch whose ack token is
/// dropped un-acked returns to the queue front, so failed handling is
/// re-delivered. Every accepted `send_event` is also recorded in a send
/// log that tests can inspect.
///
/// The transport maintains a single delivery stream. Listener groups named
/// via the `listener_group` option share it; registrations without the
/// option get unique keys, and the resulting independent groups compete
/// for the one stream.
pub struct MemoryEventTransport {
    queue: DictQueue,
    sent: Mutex<Vec<EventMessage>>,
    subscriptions: Mutex<BTreeSet<(String, String)>>,
}

impl MemoryEventTransport {
    pub fn new() -> Self {
        Self::with_batch_limit(DEFAULT_BATCH_LIMIT)
    }

    /// Cap the number of events handed out per fetch.
    pub fn with_batch_limit(batch_limit: usize) -> Self {
        Self {
            queue: DictQueue::new(batch_limit.max(1)),
            sent: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(BTreeSet::new()),
        }
    }

    /// Every event accepted by `send_event`, in order.
    pub fn sent(&self) -> Vec<EventMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Push a raw wire dict straight onto the queue, bypassing validation.
    /// Lets tests inject foreign or malformed envelopes.
    pub fn inject_raw(&self, dict: WireDict) {
        self.queue.push(dict);
    }

    /// Inject a well-formed event as if a remote process had published it.
    pub fn inject(&self, event: EventMessage) {
        self.queue.push(event.to_dict());
    }

    /// Events queued and not yet fetched (or returned for redelivery).
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// How many un-acked batches have been requeued.
    pub fn redelivered_batches(&self) -> usize {
        self.queue.redelivered_batches()
    }

    /// The (api, event) pairs currently hinted via `start_listening_for`.
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for MemoryEventTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventTransport for MemoryEventTransport {
    async fn send_event(
        &self,
        event: &EventMessage,
        _options: &TransportOptions,
    ) -> Result<(), BusError> {
        self.sent.lock().unwrap().push(event.clone());
        self.queue.push(event.to_dict());
        debug!(event = %event.canonical_name(), "event queued");
        Ok(())
    }

    async fn fetch_events(&self) -> Result<(Vec<EventMessage>, AckToken), BusError> {
        let raw = self.queue.fetch_matching(|_| true).await;
        let mut events = Vec::with_capacity(raw.len());
        for dict in &raw {
            match EventMessage::from_dict(dict) {
                Ok(event) => events.push(event),
                Err(error) => warn!(%error, "dropping undecodable event envelope"),
            }
        }
        Ok((events, self.queue.in_flight_token(raw)))
    }

    async fn consumption_complete(&self, token: AckToken) -> Result<(), BusError> {
        self.queue.complete(token)
    }

    async fn start_listening_for(
        &self,
        api_name: &str,
        event_name: &str,
        _options: &TransportOptions,
    ) -> Result<(), BusError> {
        self.subscriptions
            .lock()
            .unwrap()
            .insert((api_name.to_string(), event_name.to_string()));
        Ok(())
    }

    async fn stop_listening_for(
        &self,
        api_name: &str,
        event_name: &str,
    ) -> Result<(), BusError> {
        self.subscriptions
            .lock()
            .unwrap()
            .remove(&(api_name.to_string(), event_name.to_string()));
        Ok(())
    }

    fn listener_group_key(
        &self,
        _api_name: &str,
        _event_name: &str,
        options: &TransportOptions,
    ) -> ListenerGroupKey {
        match options.get_str("listener_group") {
            Some(group) => ListenerGroupKey::named(group),
            None => ListenerGroupKey::unique(),
        }
    }
}
