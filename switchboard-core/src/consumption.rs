//! The consumption context: a scoped fetch/acknowledge loop.
//!
//! This is the mechanism that upgrades a best-effort transport to
//! at-least-once delivery. The contract:
//!
//! 1. The underlying fetch is armed lazily, on the first `next_batch`.
//! 2. The consumer handles each batch; handling may fail, and failure
//!    propagates to the consumer's loop.
//! 3. [`Consumption::ack`] is invoked **only** after successful handling.
//!    It consumes the [`Batch`], so an un-handled batch cannot be
//!    acknowledged by accident; a batch dropped without `ack` entitles the
//!    transport to re-deliver it.
//! 4. [`Consumption::close`] releases transport-held resources on exit,
//!    normal or not.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;
use crate::message::{EventMessage, RpcMessage};
use crate::transport::{AckToken, EventTransport, RpcTransport};

/// The fetch/acknowledge pair a consumption context is wired to.
#[async_trait]
pub trait BatchSource: Send + Sync {
    type Message: Send;

    /// Called once, before the first fetch.
    async fn open(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn fetch(&self) -> Result<(Vec<Self::Message>, AckToken), BusError>;

    async fn complete(&self, token: AckToken) -> Result<(), BusError>;

    /// Release any transport-held resources.
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

/// A batch of fetched messages plus its sealed acknowledgement token.
pub struct Batch<M> {
    messages: Vec<M>,
    token: AckToken,
}

impl<M> Batch<M> {
    pub fn messages(&self) -> &[M] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn to_vec(&self) -> Vec<M>
    where
        M: Clone,
    {
        self.messages.clone()
    }
}

/// A scoped resource wrapping an RPC or event stream.
pub struct Consumption<M: Send> {
    source: Box<dyn BatchSource<Message = M>>,
    armed: bool,
}

impl<M: Send> Consumption<M> {
    pub fn new(source: impl BatchSource<Message = M> + 'static) -> Self {
        Self {
            source: Box::new(source),
            armed: false,
        }
    }

    /// Fetch the next batch, arming the source first when needed.
    pub async fn next_batch(&mut self) -> Result<Batch<M>, BusError> {
        if !self.armed {
            self.source.open().await?;
            self.armed = true;
        }
        let (messages, token) = self.source.fetch().await?;
        Ok(Batch { messages, token })
    }

    /// Acknowledge a successfully handled batch.
    pub async fn ack(&mut self, batch: Batch<M>) -> Result<(), BusError> {
        self.source.complete(batch.token).await
    }

    /// Release transport-held resources. Idempotent.
    pub async fn close(&mut self) -> Result<(), BusError> {
        if self.armed {
            self.armed = false;
            self.source.close().await
        } else {
            Ok(())
        }
    }
}

impl Consumption<RpcMessage> {
    /// A consumption context over an RPC transport's request stream for the
    /// given surfaces.
    pub fn rpcs(transport: Arc<dyn RpcTransport>, api_names: Vec<String>) -> Self {
        Self::new(RpcBatchSource {
            transport,
            api_names,
        })
    }
}

impl Consumption<EventMessage> {
    /// A consumption context over an event transport's stream.
    pub fn events(transport: Arc<dyn EventTransport>) -> Self {
        Self::new(EventBatchSource { transport })
    }
}

struct RpcBatchSource {
    transport: Arc<dyn RpcTransport>,
    api_names: Vec<String>,
}

#[async_trait]
impl BatchSource for RpcBatchSource {
    type Message = RpcMessage;

    async fn fetch(&self) -> Result<(Vec<RpcMessage>, AckToken), BusError> {
        self.transport.fetch_rpcs(&self.api_names).await
    }

    async fn complete(&self, token: AckToken) -> Result<(), BusError> {
        self.transport.consumption_complete(token).await
    }
}

struct EventBatchSource {
    transport: Arc<dyn EventTransport>,
}

#[async_trait]
impl BatchSource for EventBatchSource {
    type Message = EventMessage;

    async fn fetch(&self) -> Result<(Vec<EventMessage>, AckToken), BusError> {
        self.transport.fetch_events().await
    }

    async fn complete(&self, token: AckToken) -> Result<(), BusError> {
        self.transport.consumption_complete(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedSource {
        batches: Mutex<Vec<Vec<u32>>>,
        opened: AtomicUsize,
        completed: Mutex<Vec<usize>>,
        closed: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Vec<u32>>) -> Self {
            Self {
                batches: Mutex::new(batches),
                opened: AtomicUsize::new(0),
                completed: Mutex::new(Vec::new()),
                closed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BatchSource for &'static ScriptedSource {
        type Message = u32;

        async fn open(&self) -> Result<(), BusError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch(&self) -> Result<(Vec<u32>, AckToken), BusError> {
            let mut batches = self.batches.lock().unwrap();
            let batch = batches.remove(0);
            let id = batches.len();
            Ok((batch, AckToken::new(id)))
        }

        async fn complete(&self, token: AckToken) -> Result<(), BusError> {
            let id = *token
                .downcast::<usize>()
                .map_err(|_| BusError::Transport("foreign ack token".into()))?;
            self.completed.lock().unwrap().push(id);
            Ok(())
        }

        async fn close(&self) -> Result<(), BusError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn leaked(batches: Vec<Vec<u32>>) -> &'static ScriptedSource {
        Box::leak(Box::new(ScriptedSource::new(batches)))
    }

    #[tokio::test]
    async fn arms_once_and_acks_only_what_was_handled() {
        let source = leaked(vec![vec![1, 2], vec![3]]);
        let mut consumption = Consumption::new(source);

        let first = consumption.next_batch().await.unwrap();
        assert_eq!(first.messages(), &[1, 2]);
        consumption.ack(first).await.unwrap();

        let second = consumption.next_batch().await.unwrap();
        assert_eq!(second.to_vec(), vec![3]);
        // Handling failed: the batch is dropped without an ack.
        drop(second);

        assert_eq!(source.opened.load(Ordering::SeqCst), 1);
        assert_eq!(source.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_releases_the_source_once_armed() {
        let source = leaked(vec![vec![7]]);
        let mut consumption = Consumption::new(source);

        // Never armed: close is a no-op.
        consumption.close().await.unwrap();
        assert_eq!(source.closed.load(Ordering::SeqCst), 0);

        let batch = consumption.next_batch().await.unwrap();
        consumption.ack(batch).await.unwrap();
        consumption.close().await.unwrap();
        consumption.close().await.unwrap();
        assert_eq!(source.closed.load(Ordering::SeqCst), 1);
    }
}
