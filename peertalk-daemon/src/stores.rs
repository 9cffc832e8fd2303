//! Daemon-side store collaborators. The mobile shell backs these with its
//! synced backend; the daemon backs them with config, logs, and local disk.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peertalk_core::message::AudioRef;
use peertalk_core::store::{AudioBlobStore, BlobStoreError, FriendStore, MessageHistory};
use peertalk_core::{Message, PeerId, TransportKind};
use tracing::info;

/// Friends straight from the config file.
pub struct ConfigFriends {
    friends: HashSet<PeerId>,
}

impl ConfigFriends {
    pub fn new(friends: Vec<PeerId>) -> Arc<Self> {
        Arc::new(Self {
            friends: friends.into_iter().collect(),
        })
    }
}

#[async_trait]
impl FriendStore for ConfigFriends {
    async fn is_friend(&self, peer: PeerId) -> bool {
        self.friends.contains(&peer)
    }

    async fn friends(&self) -> Vec<PeerId> {
        self.friends.iter().copied().collect()
    }

    async fn record_connection(&self, peer: PeerId, kind: TransportKind, at: DateTime<Utc>) {
        info!(peer = %peer, kind = %kind, at = %at, "friend last-seen updated");
    }
}

/// History sink that narrates outcomes to the log.
pub struct LogHistory;

#[async_trait]
impl MessageHistory for LogHistory {
    async fn record_outcome(&self, message: Message) {
        info!(
            id = %message.id,
            recipient = %message.recipient,
            state = ?message.delivery_state,
            "message outcome recorded"
        );
    }
}

/// Voice-message blobs as files under the daemon's data dir.
pub struct FsBlobStore {
    dir: PathBuf,
    counter: AtomicU64,
}

impl FsBlobStore {
    pub fn new(dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            dir,
            counter: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl AudioBlobStore for FsBlobStore {
    async fn store_capture(&self, payload: Vec<u8>) -> Result<AudioRef, BlobStoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| BlobStoreError::Unavailable(e.to_string()))?;
        let millis = Utc::now().timestamp_millis();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("capture-{millis}-{seq}.bin"));
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| BlobStoreError::Unavailable(e.to_string()))?;
        Ok(AudioRef(path.display().to_string()))
    }
}
