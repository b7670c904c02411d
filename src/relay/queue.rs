//! Dispatch queue — bounded FIFO between admission and delivery.
//!
//! `enqueue` never waits for space: a full queue is reported as
//! `QueueError::Full` so the caller can drop and log. `dequeue` suspends
//! until an entry arrives or the queue is closed.
//!
//! Capacity counts entries until they are finished, not just while they sit
//! in the FIFO. Each entry carries a slot permit that is released only when
//! every target has been delivered, failed or abandoned, so a stalled
//! channel fills the queue instead of growing a hidden backlog downstream.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::pipeline::types::OutboundPayload;

/// An admitted payload waiting for delivery.
#[derive(Debug)]
pub struct QueueEntry {
    pub id: Uuid,
    pub payload: OutboundPayload,
    pub enqueued_at: DateTime<Utc>,
    slot: Option<OwnedSemaphorePermit>,
}

impl QueueEntry {
    pub fn new(payload: OutboundPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            enqueued_at: Utc::now(),
            slot: None,
        }
    }

    /// Take the queue slot held by this entry. Dropping it frees the slot.
    pub fn take_slot(&mut self) -> Option<OwnedSemaphorePermit> {
        self.slot.take()
    }
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    closed: bool,
}

/// Bounded FIFO of [`QueueEntry`], safe to share between tasks.
pub struct DispatchQueue {
    capacity: usize,
    slots: Arc<Semaphore>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Append a payload. Fails immediately when full or closed.
    pub async fn enqueue(&self, payload: OutboundPayload) -> Result<Uuid, QueueError> {
        let mut entry = QueueEntry::new(payload);
        let id = entry.id;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            let slot = Arc::clone(&self.slots)
                .try_acquire_owned()
                .map_err(|_| QueueError::Full {
                    capacity: self.capacity,
                })?;
            entry.slot = Some(slot);
            debug!(
                entry_id = %id,
                source_id = %entry.payload.source_message_id,
                depth = state.entries.len() + 1,
                in_flight = self.in_flight(),
                "Entry enqueued"
            );
            state.entries.push_back(entry);
        }
        self.available.notify_one();
        Ok(id)
    }

    /// Next entry in FIFO order. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<QueueEntry> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(entry) = state.entries.pop_front() {
                    return Some(entry);
                }
            }
            notified.await;
        }
    }

    /// Stop accepting entries and hand back everything still waiting.
    pub async fn close(&self) -> Vec<QueueEntry> {
        let drained: Vec<QueueEntry> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.entries.drain(..).collect()
        };
        self.available.notify_waiters();
        drained
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries admitted and not yet finished, queued or out on lanes.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}
