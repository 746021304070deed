//! Shared queue machinery for the in-memory transports.
//!
//! Messages are stored in their canonical dict form. A fetch drains up to
//! `batch_limit` matching entries and parks them in an in-flight guard that
//! travels inside the batch's ack token. Acknowledging the batch discards
//! the guard; dropping it un-acked pushes the entries back to the front of
//! the queue, which is what makes redelivery observable in-process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use switchboard_core::error::BusError;
use switchboard_core::message::WireDict;
use switchboard_core::transport::AckToken;

pub(crate) struct DictQueue {
    state: Arc<QueueState>,
    batch_limit: usize,
}

struct QueueState {
    entries: Mutex<VecDeque<WireDict>>,
    notify: Notify,
    redelivered_batches: AtomicUsize,
}

impl DictQueue {
    pub(crate) fn new(batch_limit: usize) -> Self {
        Self {
            state: Arc::new(QueueState {
                entries: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                redelivered_batches: AtomicUsize::new(0),
            }),
            batch_limit,
        }
    }

    pub(crate) fn push(&self, dict: WireDict) {
        self.state.entries.lock().unwrap().push_back(dict);
        // Consumers may filter; wake them all and let each re-check.
        self.state.notify.notify_waiters();
    }

    /// Wait until at least one matching entry is queued, then drain up to
    /// the batch limit of them, leaving non-matching entries in place.
    pub(crate) async fn fetch_matching(
        &self,
        matches: impl Fn(&WireDict) -> bool,
    ) -> Vec<WireDict> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the queue, so a push between
            // the check and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(drained) = self.try_drain(&matches) {
                return drained;
            }
            notified.await;
        }
    }

    fn try_drain(&self, matches: &impl Fn(&WireDict) -> bool) -> Option<Vec<WireDict>> {
        let mut entries = self.state.entries.lock().unwrap();
        let mut drained = Vec::new();
        let mut index = 0;
        while index < entries.len() && drained.len() < self.batch_limit {
            if matches(&entries[index]) {
                drained.push(entries.remove(index).expect("index is in bounds"));
            } else {
                index += 1;
            }
        }
        if drained.is_empty() {
            None
        } else {
            Some(drained)
        }
    }

    /// Seal a drained batch into an ack token carrying the redelivery
    /// guard.
    pub(crate) fn in_flight_token(&self, entries: Vec<WireDict>) -> AckToken {
        AckToken::new(InFlight {
            state: self.state.clone(),
            entries,
            acked: false,
        })
    }

    /// Mark the batch behind the token as handled, discarding its guard.
    pub(crate) fn complete(&self, token: AckToken) -> Result<(), BusError> {
        let mut guard = token.downcast::<InFlight>().map_err(|_| {
            BusError::Transport("ack token was not minted by this transport".to_string())
        })?;
        guard.acked = true;
        Ok(())
    }

    pub(crate) fn pending(&self) -> usize {
        self.state.entries.lock().unwrap().len()
    }

    /// How many un-acked batches were pushed back for redelivery.
    pub(crate) fn redelivered_batches(&self) -> usize {
        self.state.redelivered_batches.load(Ordering::SeqCst)
    }
}

/// Travels inside the ack token; un-acked entries return to the queue
/// front when it drops.
struct InFlight {
    state: Arc<QueueState>,
    entries: Vec<WireDict>,
    acked: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.acked || self.entries.is_empty() {
            return;
        }
        debug!(
            count = self.entries.len(),
            "redelivering unacknowledged batch"
        );
        {
            let mut entries = self.state.entries.lock().unwrap();
            for entry in self.entries.drain(..).rev() {
                entries.push_front(entry);
            }
        }
        self.state.redelivered_batches.fetch_add(1, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }
}
