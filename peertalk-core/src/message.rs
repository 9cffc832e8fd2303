//! Asynchronous messages: the unit of store-and-forward delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Unique message identifier (UUID bytes). Globally unique so duplicate
/// deliveries after a reconnect can be detected downstream.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn new() -> Self {
        MessageId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Opaque reference to a stored audio capture (URL or store key).
/// The engine never interprets it; it round-trips to the blob store.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct AudioRef(pub String);

/// Message payload: inline text, or a reference to a recorded audio blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    Text(String),
    Audio(AudioRef),
}

/// Delivery lifecycle. Transitions are monotone; `Delivered` and `Failed`
/// are terminal and immutable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliveryState {
    Queued,
    InFlight,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Failed)
    }
}

/// One queued message. Owned by the queue until a terminal state, then handed
/// to the message-history collaborator.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub sender: PeerId,
    pub recipient: PeerId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
    /// Populated when `delivery_state` is `Failed`.
    pub failure_reason: Option<String>,
}

impl Message {
    pub fn new(sender: PeerId, recipient: PeerId, body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            recipient,
            body,
            created_at: Utc::now(),
            delivery_state: DeliveryState::Queued,
            failure_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn new_message_starts_queued() {
        let a = Keypair::generate().peer_id();
        let b = Keypair::generate().peer_id();
        let m = Message::new(a, b, MessageBody::Text("at the summit".into()));
        assert_eq!(m.delivery_state, DeliveryState::Queued);
        assert!(m.failure_reason.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(!DeliveryState::Queued.is_terminal());
        assert!(!DeliveryState::InFlight.is_terminal());
        assert!(DeliveryState::Delivered.is_terminal());
        assert!(DeliveryState::Failed.is_terminal());
    }

    #[test]
    fn message_ids_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }
}
