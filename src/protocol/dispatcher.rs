use crate::error::{constants, LdapError, Result};
use crate::protocol::message::{LdapMessage, MAX_MESSAGE_ID};
use crate::utils::metrics::Metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Receiving end of a pending request's response queue
pub type ResponseReceiver = mpsc::UnboundedReceiver<Result<LdapMessage>>;

type ResponseSink = mpsc::UnboundedSender<Result<LdapMessage>>;

struct PendingRequest {
    sink: ResponseSink,
    deadline: Option<Instant>,
    op: &'static str,
}

struct PendingTable {
    next_id: i32,
    max_id: i32,
    entries: HashMap<i32, PendingRequest>,
}

impl PendingTable {
    /// Next free ID in `1..=max_id`, advancing the cursor past it
    fn allocate(&mut self) -> Result<i32> {
        // Every live entry can be skipped at most once
        for _ in 0..=self.entries.len() {
            let candidate = self.next_id;
            self.next_id = if candidate >= self.max_id {
                1
            } else {
                candidate + 1
            };
            if !self.entries.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(LdapError::MessageIdExhausted)
    }
}

/// Outcome of routing one incoming message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Delivered to a pending request; `terminal` when it completed the request
    Delivered { terminal: bool },
    /// Message ID 0, broadcast to notification subscribers
    Unsolicited,
    /// No pending request with this ID
    Discarded,
}

/// Message-ID correlation for one connection.
///
/// Owns the pending-request table. IDs are allocated and registered under the
/// same lock, so two concurrent callers never observe the same ID.
pub struct Dispatcher {
    pending: Mutex<PendingTable>,
    notifications: broadcast::Sender<LdapMessage>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(notification_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self::with_id_range(1, MAX_MESSAGE_ID, notification_capacity, metrics)
    }

    pub(crate) fn with_id_range(
        first_id: i32,
        max_id: i32,
        notification_capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(notification_capacity.max(1));
        Self {
            pending: Mutex::new(PendingTable {
                next_id: first_id.clamp(1, max_id.max(1)),
                max_id: max_id.max(1),
                entries: HashMap::new(),
            }),
            notifications,
            metrics,
        }
    }

    fn table(&self) -> Result<MutexGuard<'_, PendingTable>> {
        self.pending
            .lock()
            .map_err(|_| LdapError::Custom(constants::ERR_PENDING_LOCK.to_string()))
    }

    /// Allocate a message ID and register a pending request for it
    pub fn register(
        &self,
        op: &'static str,
        deadline: Option<Instant>,
    ) -> Result<(i32, ResponseReceiver)> {
        let mut table = self.table()?;
        let id = table.allocate()?;
        let (sink, receiver) = mpsc::unbounded_channel();
        table.entries.insert(id, PendingRequest { sink, deadline, op });
        trace!(message_id = id, op, "Registered pending request");
        Ok((id, receiver))
    }

    /// Allocate an ID for a request that expects no response (Abandon, Unbind)
    pub fn allocate_id(&self) -> Result<i32> {
        self.table()?.allocate()
    }

    /// Route a decoded message to its waiter
    pub fn route(&self, msg: LdapMessage) -> Result<Routed> {
        if msg.is_unsolicited() {
            self.metrics.notification_received();
            debug!(op = msg.op.name(), "Unsolicited notification");
            // No subscribers is not an error
            let _ = self.notifications.send(msg);
            return Ok(Routed::Unsolicited);
        }

        let id = msg.message_id;
        let terminal = !msg.op.is_fragment();
        let mut table = self.table()?;

        let Some(entry) = table.entries.get(&id) else {
            self.metrics.response_discarded();
            debug!(message_id = id, op = msg.op.name(), "Discarding response with no pending request");
            return Ok(Routed::Discarded);
        };

        let receiver_alive = entry.sink.send(Ok(msg)).is_ok();
        if terminal || !receiver_alive {
            table.entries.remove(&id);
        }
        self.metrics.response_routed();
        Ok(Routed::Delivered { terminal })
    }

    /// Drop the pending entry for `id` and fail its waiter with `Abandoned`.
    ///
    /// Returns whether an entry existed; unknown IDs are a no-op.
    pub fn abandon(&self, id: i32) -> Result<bool> {
        let removed = self.table()?.entries.remove(&id);
        Ok(match removed {
            Some(entry) => {
                let _ = entry.sink.send(Err(LdapError::Abandoned(id)));
                debug!(message_id = id, op = entry.op, "Abandoned pending request");
                true
            }
            None => false,
        })
    }

    /// Drop the pending entry without notifying its waiter
    pub fn release(&self, id: i32) {
        if let Ok(mut table) = self.table() {
            table.entries.remove(&id);
        }
    }

    /// Fail the pending request `id` with a timeout
    pub fn expire(&self, id: i32) -> Result<bool> {
        let removed = self.table()?.entries.remove(&id);
        Ok(match removed {
            Some(entry) => {
                self.metrics.timeout();
                let _ = entry.sink.send(Err(LdapError::Timeout));
                warn!(message_id = id, op = entry.op, "Request timed out");
                true
            }
            None => false,
        })
    }

    /// Fail every pending request whose deadline is at or before `now`
    pub fn expire_overdue(&self, now: Instant) -> Result<usize> {
        let mut table = self.table()?;
        let overdue: Vec<i32> = table
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in &overdue {
            if let Some(entry) = table.entries.remove(id) {
                self.metrics.timeout();
                let _ = entry.sink.send(Err(LdapError::Timeout));
                warn!(message_id = *id, op = entry.op, "Request timed out");
            }
        }
        Ok(overdue.len())
    }

    /// Fail every pending request with an error built by `make_error`
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> LdapError,
    {
        let drained: Vec<(i32, PendingRequest)> = match self.pending.lock() {
            Ok(mut table) => table.entries.drain().collect(),
            // The table is being torn down; recover whatever it holds
            Err(poisoned) => poisoned.into_inner().entries.drain().collect(),
        };
        let count = drained.len();
        for (id, entry) in drained {
            trace!(message_id = id, op = entry.op, "Failing pending request");
            let _ = entry.sink.send(Err(make_error()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, id: i32) -> bool {
        self.table()
            .map(|t| t.entries.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<LdapMessage> {
        self.notifications.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
