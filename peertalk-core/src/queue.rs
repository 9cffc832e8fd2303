//! Store-and-forward queue: per-peer FIFO of pending outbound messages.
//!
//! The queue owns every message until it reaches a terminal state. Ordering
//! is the invariant that survives everything else: a message never overtakes
//! an earlier one to the same peer, including across retries — a failed
//! transmission puts the message back at the head, not the tail.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::identity::PeerId;
use crate::message::{DeliveryState, Message, MessageId};

struct Entry {
    message: Message,
    /// Transmission attempts so far (failed sends, not enqueue count).
    attempts: u32,
}

#[derive(Default)]
struct PeerQueue {
    entries: VecDeque<Entry>,
}

/// Outcome of a failed transmission.
#[derive(Debug)]
pub enum RetryOutcome {
    /// Back at the head of its queue, awaiting the next drain.
    Requeued,
    /// Retry ceiling exceeded; the message is terminally failed and no
    /// longer owned by the queue.
    Failed(Message),
}

/// Per-peer FIFO queues with retry accounting. Access is serialized per
/// peer: the map lock is held only to find a queue, never across an
/// operation on one.
pub struct MessageQueue {
    queues: Mutex<HashMap<PeerId, Arc<Mutex<PeerQueue>>>>,
    retry_ceiling: u32,
}

impl MessageQueue {
    pub fn new(retry_ceiling: u32) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            retry_ceiling,
        }
    }

    fn queue_for(&self, peer: PeerId) -> Arc<Mutex<PeerQueue>> {
        self.queues
            .lock()
            .expect("queue map lock poisoned")
            .entry(peer)
            .or_default()
            .clone()
    }

    /// Take ownership of a message for delivery. Returns its id.
    pub fn enqueue(&self, mut message: Message) -> MessageId {
        message.delivery_state = DeliveryState::Queued;
        let id = message.id;
        let recipient = message.recipient;
        let queue = self.queue_for(recipient);
        let mut q = queue.lock().expect("peer queue lock poisoned");
        q.entries.push_back(Entry {
            message,
            attempts: 0,
        });
        debug!(peer = %recipient, id = %id, pending = q.entries.len(), "message queued");
        id
    }

    /// Next message to transmit for `peer`: the head, if it is not already
    /// in flight. Marks it in flight. FIFO means there is never more than
    /// one in-flight message per peer.
    pub fn next_for(&self, peer: PeerId) -> Option<Message> {
        let queue = self.queue_for(peer);
        let mut q = queue.lock().expect("peer queue lock poisoned");
        let head = q.entries.front_mut()?;
        if head.message.delivery_state != DeliveryState::Queued {
            return None;
        }
        head.message.delivery_state = DeliveryState::InFlight;
        Some(head.message.clone())
    }

    /// Explicitly mark a message in flight. No-op if it is absent (already
    /// terminal) or already in flight.
    pub fn mark_in_flight(&self, peer: PeerId, id: MessageId) {
        let queue = self.queue_for(peer);
        let mut q = queue.lock().expect("peer queue lock poisoned");
        if let Some(e) = q.entries.iter_mut().find(|e| e.message.id == id) {
            if e.message.delivery_state == DeliveryState::Queued {
                e.message.delivery_state = DeliveryState::InFlight;
            }
        }
    }

    /// Terminal success. Removes the message and returns it for history
    /// hand-off; calling again for the same id is a no-op returning `None`.
    pub fn mark_delivered(&self, peer: PeerId, id: MessageId) -> Option<Message> {
        let queue = self.queue_for(peer);
        let mut q = queue.lock().expect("peer queue lock poisoned");
        let idx = q.entries.iter().position(|e| e.message.id == id)?;
        let mut entry = q.entries.remove(idx)?;
        entry.message.delivery_state = DeliveryState::Delivered;
        Some(entry.message)
    }

    /// Terminal failure. Removes the message and returns it for surfacing;
    /// idempotent like `mark_delivered`.
    pub fn mark_failed(&self, peer: PeerId, id: MessageId, reason: &str) -> Option<Message> {
        let queue = self.queue_for(peer);
        let mut q = queue.lock().expect("peer queue lock poisoned");
        let idx = q.entries.iter().position(|e| e.message.id == id)?;
        let mut entry = q.entries.remove(idx)?;
        entry.message.delivery_state = DeliveryState::Failed;
        entry.message.failure_reason = Some(reason.to_string());
        Some(entry.message)
    }

    /// A transmission failed. Counts the attempt; the message either returns
    /// to the head of its queue or, past the ceiling, fails terminally.
    pub fn retry_or_fail(&self, peer: PeerId, id: MessageId, reason: &str) -> RetryOutcome {
        let exhausted = {
            let queue = self.queue_for(peer);
            let mut q = queue.lock().expect("peer queue lock poisoned");
            let Some(e) = q.entries.iter_mut().find(|e| e.message.id == id) else {
                // Already terminal; nothing to retry.
                return RetryOutcome::Requeued;
            };
            e.attempts += 1;
            if e.attempts > self.retry_ceiling {
                true
            } else {
                e.message.delivery_state = DeliveryState::Queued;
                debug!(peer = %peer, id = %id, attempt = e.attempts, "requeued at head: {reason}");
                false
            }
        };
        if exhausted {
            match self.mark_failed(peer, id, reason) {
                Some(message) => RetryOutcome::Failed(message),
                None => RetryOutcome::Requeued,
            }
        } else {
            RetryOutcome::Requeued
        }
    }

    /// Messages still owned by the queue for this peer.
    pub fn pending_for(&self, peer: PeerId) -> usize {
        let queue = self.queue_for(peer);
        let q = queue.lock().expect("peer queue lock poisoned");
        q.entries.len()
    }
}
