//! External store collaborators. The engine never talks to a backend
//! directly; hosts implement these seams against whatever storage they have.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::identity::PeerId;
use crate::link::TransportKind;
use crate::message::{AudioRef, Message};

/// The synced friends list. Read-mostly from the engine's side; the one
/// write is last-seen upkeep on every successful connection.
#[async_trait]
pub trait FriendStore: Send + Sync {
    async fn is_friend(&self, peer: PeerId) -> bool;
    /// All known friends, for group sends.
    async fn friends(&self) -> Vec<PeerId>;
    async fn record_connection(&self, peer: PeerId, kind: TransportKind, at: DateTime<Utc>);
}

/// Message history sink. The engine only appends outcomes — delivered or
/// terminally failed messages — and never reads history back.
#[async_trait]
pub trait MessageHistory: Send + Sync {
    async fn record_outcome(&self, message: Message);
}

/// Storage for recorded voice messages. The engine stores a capture once
/// and passes the opaque reference through the queue.
#[async_trait]
pub trait AudioBlobStore: Send + Sync {
    async fn store_capture(&self, payload: Vec<u8>) -> Result<AudioRef, BlobStoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("audio blob store unavailable: {0}")]
    Unavailable(String),
}
