//! Transport contracts: RPC, Result, and Event.
//!
//! Backends are external; the core depends only on the contracts below. The
//! fetch/acknowledge pairs on the RPC and Event transports are what the
//! [consumption context](crate::consumption) is wired to: a batch that is
//! never acknowledged must be re-delivered on a future fetch, which is the
//! hook that provides at-least-once delivery.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::BusError;
use crate::message::{EventMessage, ResultMessage, RpcMessage};

/// Backend-specific options accompanying a transport operation.
///
/// `timeout` is first-class because the core consults it for
/// `receive_result`; everything else is an open bag of backend keys.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub timeout: Option<Duration>,
    extra: BTreeMap<String, Value>,
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Opaque acknowledgement token returned by a fetch and handed back on
/// successful handling of the batch.
pub struct AckToken(Box<dyn Any + Send>);

impl AckToken {
    pub fn new(token: impl Any + Send) -> Self {
        Self(Box::new(token))
    }

    /// Recover the backend's token type. Returns the token unchanged when
    /// it was minted by a different backend.
    pub fn downcast<T: Any>(self) -> Result<Box<T>, AckToken> {
        self.0.downcast::<T>().map_err(AckToken)
    }
}

impl fmt::Debug for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AckToken(..)")
    }
}

/// Key identifying a group of listener registrations that share one
/// underlying transport subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerGroupKey(String);

impl ListenerGroupKey {
    /// A fresh key that collapses nothing — every registration gets its own
    /// subscription. The safe default.
    pub fn unique() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// A key under which registrations share a subscription.
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sending and receiving of RPC calls.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Publish a call to a remote procedure. Failures are surfaced to the
    /// caller.
    async fn call_rpc(
        &self,
        request: &RpcMessage,
        options: &TransportOptions,
    ) -> Result<(), BusError>;

    /// Fetch the next batch of requests addressed to any of the given
    /// surfaces. Only requests targeting one of the passed surfaces are
    /// yielded.
    async fn fetch_rpcs(
        &self,
        api_names: &[String],
    ) -> Result<(Vec<RpcMessage>, AckToken), BusError>;

    /// Acknowledge a batch as successfully handled. A batch whose token is
    /// never passed back must be re-delivered on a future fetch.
    async fn consumption_complete(&self, token: AckToken) -> Result<(), BusError>;
}

/// Sending and receiving of RPC results.
#[async_trait]
pub trait ResultTransport: Send + Sync {
    /// Produce the opaque address the result of this request must be
    /// delivered to. The same request yields the same path on both ends;
    /// typically derived from `rpc_id`.
    fn get_return_path(&self, request: &RpcMessage) -> String;

    /// Publish a result to the given return path.
    async fn send_result(
        &self,
        request: &RpcMessage,
        result: &ResultMessage,
        return_path: &str,
    ) -> Result<(), BusError>;

    /// Block until the result is available at the path, or fail with
    /// [`BusError::RpcTimeout`] when `options.timeout` expires first.
    async fn receive_result(
        &self,
        request: &RpcMessage,
        return_path: &str,
        options: &TransportOptions,
    ) -> Result<ResultMessage, BusError>;
}

/// Sending and consumption of events.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Publish an event.
    async fn send_event(
        &self,
        event: &EventMessage,
        options: &TransportOptions,
    ) -> Result<(), BusError>;

    /// Fetch the next batch of events plus its acknowledgement token.
    ///
    /// Events outside the set currently subscribed to are allowed in the
    /// batch; the client filters them.
    async fn fetch_events(&self) -> Result<(Vec<EventMessage>, AckToken), BusError>;

    /// Acknowledge a batch as successfully handled. A batch whose token is
    /// never passed back must be re-delivered on a future fetch.
    async fn consumption_complete(&self, token: AckToken) -> Result<(), BusError>;

    /// Hint that events of the given name are now wanted. Backends may use
    /// this to subscribe selectively; the default does nothing.
    async fn start_listening_for(
        &self,
        _api_name: &str,
        _event_name: &str,
        _options: &TransportOptions,
    ) -> Result<(), BusError> {
        Ok(())
    }

    /// Hint that events of the given name are no longer wanted.
    async fn stop_listening_for(
        &self,
        _api_name: &str,
        _event_name: &str,
    ) -> Result<(), BusError> {
        Ok(())
    }

    /// Key grouping listener registrations onto one underlying
    /// subscription: registrations with equal keys share a stream and each
    /// delivered event reaches all of their callbacks; distinct keys get
    /// independent subscriptions.
    ///
    /// Backends offering replay (e.g. "all events since X") must return
    /// distinct keys for registrations with distinct replay start points —
    /// otherwise a new from-the-beginning listener would attach to a
    /// real-time listener's stream and retroactively flood it.
    ///
    /// The default returns a fresh unique key, collapsing nothing.
    fn listener_group_key(
        &self,
        _api_name: &str,
        _event_name: &str,
        _options: &TransportOptions,
    ) -> ListenerGroupKey {
        ListenerGroupKey::unique()
    }
}
