//! The engine facade: what a host (daemon, mobile shell) drives.
//!
//! Wires discovery → session → delivery together and exposes the caller
//! surface: press/release talk, send/broadcast messages, mute, and a status
//! feed for connection state and delivery outcomes.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use crate::audio::{AudioPipeline, CaptureDevice, PlaybackDevice, TalkHoldId};
use crate::config::EngineConfig;
use crate::delivery::{DeliveryCoordinator, DeliverySignal};
use crate::discovery::{Discovery, DiscoveryBackend};
use crate::identity::PeerId;
use crate::link::{Connector, LinkIo, TransportKind};
use crate::message::{Message, MessageBody, MessageId};
use crate::queue::MessageQueue;
use crate::session::{SessionManager, TalkError, TalkHold};
use crate::store::{AudioBlobStore, BlobStoreError, FriendStore, MessageHistory};

/// Discovery events buffered between backends and the session loop.
const DISCOVERY_EVENT_BUFFER: usize = 64;

/// Everything the engine reports to its caller. Connection states feed the
/// status display; delivery outcomes and inbound messages feed the UI layer.
#[derive(Debug, Clone)]
pub enum EngineStatus {
    PeerConnected {
        peer: PeerId,
        kind: TransportKind,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    /// Current count of connected peers, emitted on every change.
    ReachablePeers(usize),
    /// A talk hold started with nobody in range; audio stays local.
    NoReachablePeers,
    TransportUnavailable {
        kind: TransportKind,
        reason: String,
    },
    MessageDelivered {
        id: MessageId,
        recipient: PeerId,
    },
    /// Terminal delivery failure; never silent.
    DeliveryFailed {
        id: MessageId,
        recipient: PeerId,
        reason: String,
    },
    MessageReceived {
        id: MessageId,
        from: PeerId,
        body: MessageBody,
        sent_at: DateTime<Utc>,
    },
}

pub struct PeerTalkEngine {
    local: PeerId,
    session: Arc<SessionManager>,
    queue: Arc<MessageQueue>,
    delivery_signals: mpsc::UnboundedSender<DeliverySignal>,
    audio: Arc<AudioPipeline>,
    discovery: Discovery,
    friends: Arc<dyn FriendStore>,
    blobs: Arc<dyn AudioBlobStore>,
}

impl PeerTalkEngine {
    /// Assemble and start the engine. Background loops (session events,
    /// liveness, delivery) begin immediately; scanning starts on request.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        local: PeerId,
        connector: Arc<dyn Connector>,
        discovery_backends: Vec<Arc<dyn DiscoveryBackend>>,
        capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackDevice>,
        friends: Arc<dyn FriendStore>,
        history: Arc<dyn MessageHistory>,
        blobs: Arc<dyn AudioBlobStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineStatus>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let audio = Arc::new(AudioPipeline::new(capture, playback));
        let queue = Arc::new(MessageQueue::new(cfg.delivery_retry_ceiling));

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let coordinator = DeliveryCoordinator::new(
            queue.clone(),
            history,
            status_tx.clone(),
            cfg.delivery_ack_timeout,
        );
        let _ = coordinator.spawn(delivery_rx);

        let (discovery_tx, discovery_rx) = mpsc::channel(DISCOVERY_EVENT_BUFFER);
        let discovery = Discovery::new(discovery_backends, discovery_tx);

        let (session, link_rx) = SessionManager::new(
            cfg,
            local,
            connector,
            friends.clone(),
            audio.clone(),
            status_tx,
            delivery_tx.clone(),
        );
        let _ = session.spawn(discovery_rx, link_rx);

        let engine = Arc::new(Self {
            local,
            session,
            queue,
            delivery_signals: delivery_tx,
            audio,
            discovery,
            friends,
            blobs,
        });
        (engine, status_rx)
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    // ---- discovery ----------------------------------------------------

    pub fn start_scanning(&self, kinds: &HashSet<TransportKind>) {
        self.discovery.start_scanning(kinds);
    }

    pub fn stop_scanning(&self) {
        self.discovery.stop_scanning();
    }

    /// Hand over a connection accepted by the host listener. Strangers are
    /// turned away here; the friends list is the admission policy.
    pub async fn accept_link(&self, peer: PeerId, kind: TransportKind, io: LinkIo) -> bool {
        if !self.friends.is_friend(peer).await {
            warn!(peer = %peer, "rejecting connection from non-friend");
            return false;
        }
        self.session.install_link(peer, kind, io, None).await
    }

    pub async fn reachable_peers(&self) -> usize {
        self.session.reachable_count().await
    }

    // ---- talk ---------------------------------------------------------

    pub async fn press_talk(&self) -> Result<TalkHoldId, TalkError> {
        self.session.press_talk().await
    }

    pub async fn release_talk(&self) -> Option<TalkHold> {
        self.session.release_talk().await
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.audio.is_muted()
    }

    // ---- messaging ----------------------------------------------------

    /// Queue a message for a peer. Delivery is immediate when the peer is
    /// reachable, deferred until it reconnects otherwise.
    pub async fn send_message(&self, recipient: PeerId, body: MessageBody) -> MessageId {
        let message = Message::new(self.local, recipient, body);
        let id = self.queue.enqueue(message);
        if let Some(link) = self.session.link_for(recipient).await {
            let _ = self
                .delivery_signals
                .send(DeliverySignal::PeerReady {
                    peer: recipient,
                    link,
                });
        }
        id
    }

    pub async fn send_text(&self, recipient: PeerId, text: impl Into<String>) -> MessageId {
        self.send_message(recipient, MessageBody::Text(text.into()))
            .await
    }

    /// Store a recorded capture and queue the resulting reference.
    pub async fn send_voice_message(
        &self,
        recipient: PeerId,
        payload: Vec<u8>,
    ) -> Result<MessageId, BlobStoreError> {
        let audio_ref = self.blobs.store_capture(payload).await?;
        Ok(self
            .send_message(recipient, MessageBody::Audio(audio_ref))
            .await)
    }

    /// Group send: one queued message per known friend.
    pub async fn broadcast_message(&self, body: MessageBody) -> Vec<MessageId> {
        let mut ids = Vec::new();
        for friend in self.friends.friends().await {
            if friend == self.local {
                continue;
            }
            ids.push(self.send_message(friend, body.clone()).await);
        }
        ids
    }

    /// Stop scanning, seal any active hold, and close every link.
    pub async fn shutdown(&self) {
        self.discovery.stop_scanning();
        self.session.release_talk().await;
        self.session.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testutil::{RecordingPlayback, ScriptedCapture};
    use crate::discovery::testutil::ScriptedBackend;
    use crate::discovery::{DiscoveryEvent, PeerSighting};
    use crate::identity::Keypair;
    use crate::link::testio::memory_pair;
    use crate::link::ConnectError;
    use crate::store::testutil::{CountingBlobs, FixedFriends, RecordingHistory};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// In-memory "network": connecting to a peer hands the other engine the
    /// far end of a fresh memory pair, exactly like a host listener would.
    #[derive(Default)]
    struct Hub {
        engines: StdMutex<HashMap<PeerId, Arc<PeerTalkEngine>>>,
    }

    impl Hub {
        fn register(&self, engine: Arc<PeerTalkEngine>) {
            self.engines
                .lock()
                .unwrap()
                .insert(engine.local_id(), engine);
        }
    }

    struct HubConnector {
        hub: Arc<Hub>,
        local: PeerId,
    }

    #[async_trait]
    impl Connector for HubConnector {
        async fn connect(&self, peer: PeerId, kind: TransportKind) -> Result<LinkIo, ConnectError> {
            let target = self
                .hub
                .engines
                .lock()
                .unwrap()
                .get(&peer)
                .cloned()
                .ok_or_else(|| ConnectError::Failed("peer not on network".into()))?;
            let (near, far, _faults) = memory_pair();
            if target.accept_link(self.local, kind, far).await {
                Ok(near)
            } else {
                Err(ConnectError::Failed("connection refused".into()))
            }
        }
    }

    struct TestNode {
        engine: Arc<PeerTalkEngine>,
        status_rx: mpsc::UnboundedReceiver<EngineStatus>,
        feed: mpsc::UnboundedSender<DiscoveryEvent>,
        playback: RecordingPlayback,
        history: Arc<RecordingHistory>,
    }

    fn node(
        hub: &Arc<Hub>,
        local: PeerId,
        friends: &[PeerId],
        capture_payloads: Vec<Vec<u8>>,
    ) -> TestNode {
        let cfg = EngineConfig {
            connect_backoff_base: Duration::from_millis(5),
            connect_backoff_cap: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(500),
            liveness_sweep_interval: Duration::from_millis(100),
            delivery_ack_timeout: Duration::from_millis(500),
            ..EngineConfig::default()
        };
        let playback = RecordingPlayback::default();
        let history = Arc::new(RecordingHistory::default());
        let (backend, feed) = ScriptedBackend::new(TransportKind::WifiDirect);
        let (engine, status_rx) = PeerTalkEngine::new(
            cfg,
            local,
            Arc::new(HubConnector {
                hub: hub.clone(),
                local,
            }),
            vec![backend],
            Box::new(ScriptedCapture::new(capture_payloads)),
            Box::new(playback.clone()),
            FixedFriends::of(friends),
            history.clone(),
            Arc::new(CountingBlobs::default()),
        );
        engine.start_scanning(&HashSet::from([TransportKind::WifiDirect]));
        hub.register(engine.clone());
        TestNode {
            engine,
            status_rx,
            feed,
            playback,
            history,
        }
    }

    fn sighting_of(peer: PeerId) -> DiscoveryEvent {
        DiscoveryEvent::Sighted(PeerSighting {
            peer,
            kind: TransportKind::WifiDirect,
            quality: 0,
            seen_at: Utc::now(),
        })
    }

    async fn wait_for<F: Fn(&EngineStatus) -> bool>(
        rx: &mut mpsc::UnboundedReceiver<EngineStatus>,
        pred: F,
    ) -> EngineStatus {
        loop {
            let status = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for status")
                .expect("status channel closed");
            if pred(&status) {
                return status;
            }
        }
    }

    #[tokio::test]
    async fn queued_message_delivers_once_peer_connects() {
        let hub = Arc::new(Hub::default());
        let id_a = Keypair::generate().peer_id();
        let id_b = Keypair::generate().peer_id();
        let mut a = node(&hub, id_a, &[id_b], vec![]);
        let mut b = node(&hub, id_b, &[id_a], vec![]);

        // B is out of range: the message waits in A's queue.
        let msg_id = a.engine.send_text(id_b, "see you at the ridge").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(a.engine.reachable_peers().await, 0);

        // B comes into range; the queue drains on connect.
        a.feed.send(sighting_of(id_b)).unwrap();
        wait_for(&mut a.status_rx, |s| {
            matches!(s, EngineStatus::MessageDelivered { id, .. } if *id == msg_id)
        })
        .await;
        let received = wait_for(&mut b.status_rx, |s| {
            matches!(s, EngineStatus::MessageReceived { .. })
        })
        .await;
        match received {
            EngineStatus::MessageReceived { from, body, .. } => {
                assert_eq!(from, id_a);
                assert!(matches!(body, MessageBody::Text(t) if t == "see you at the ridge"));
            }
            _ => unreachable!(),
        }

        // Delivered outcome went to history.
        let outcomes = a.history.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].delivery_state,
            crate::message::DeliveryState::Delivered
        );
    }

    #[tokio::test]
    async fn message_to_connected_peer_delivers_immediately() {
        let hub = Arc::new(Hub::default());
        let id_a = Keypair::generate().peer_id();
        let id_b = Keypair::generate().peer_id();
        let mut a = node(&hub, id_a, &[id_b], vec![]);
        let mut b = node(&hub, id_b, &[id_a], vec![]);

        a.feed.send(sighting_of(id_b)).unwrap();
        wait_for(&mut a.status_rx, |s| {
            matches!(s, EngineStatus::PeerConnected { .. })
        })
        .await;

        let msg_id = a.engine.send_text(id_b, "go ahead").await;
        wait_for(&mut a.status_rx, |s| {
            matches!(s, EngineStatus::MessageDelivered { id, .. } if *id == msg_id)
        })
        .await;
        wait_for(&mut b.status_rx, |s| {
            matches!(s, EngineStatus::MessageReceived { id, .. } if *id == msg_id)
        })
        .await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_friend() {
        let hub = Arc::new(Hub::default());
        let id_a = Keypair::generate().peer_id();
        let id_b = Keypair::generate().peer_id();
        let id_c = Keypair::generate().peer_id();
        let mut a = node(&hub, id_a, &[id_b, id_c], vec![]);
        let mut b = node(&hub, id_b, &[id_a], vec![]);
        let mut c = node(&hub, id_c, &[id_a], vec![]);

        a.feed.send(sighting_of(id_b)).unwrap();
        a.feed.send(sighting_of(id_c)).unwrap();
        for _ in 0..2 {
            wait_for(&mut a.status_rx, |s| {
                matches!(s, EngineStatus::PeerConnected { .. })
            })
            .await;
        }

        let ids = a
            .engine
            .broadcast_message(MessageBody::Text("camp at dusk".into()))
            .await;
        assert_eq!(ids.len(), 2);

        wait_for(&mut b.status_rx, |s| {
            matches!(s, EngineStatus::MessageReceived { .. })
        })
        .await;
        wait_for(&mut c.status_rx, |s| {
            matches!(s, EngineStatus::MessageReceived { .. })
        })
        .await;
    }

    #[tokio::test]
    async fn strangers_cannot_connect() {
        let hub = Arc::new(Hub::default());
        let id_a = Keypair::generate().peer_id();
        let id_s = Keypair::generate().peer_id();
        let a = node(&hub, id_a, &[], vec![]); // nobody is a friend of A
        let s = node(&hub, id_s, &[id_a], vec![]);

        s.feed.send(sighting_of(id_a)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.engine.reachable_peers().await, 0);
        assert_eq!(s.engine.reachable_peers().await, 0);
    }

    #[tokio::test]
    async fn hold_streams_audio_to_connected_peer() {
        let hub = Arc::new(Hub::default());
        let id_a = Keypair::generate().peer_id();
        let id_b = Keypair::generate().peer_id();
        let payloads: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i; 4]).collect();
        let mut a = node(&hub, id_a, &[id_b], payloads);
        let b = node(&hub, id_b, &[id_a], vec![]);

        a.feed.send(sighting_of(id_b)).unwrap();
        wait_for(&mut a.status_rx, |s| {
            matches!(s, EngineStatus::PeerConnected { .. })
        })
        .await;

        let _hold = a.engine.press_talk().await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if b.playback.rendered.lock().unwrap().len() >= 3 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no audio reached the peer"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let hold = a.engine.release_talk().await.unwrap();
        assert!(hold.participants.contains(&id_b));
        assert!(hold.ended_at.is_some());
    }

    #[tokio::test]
    async fn voice_message_goes_through_blob_store() {
        let hub = Arc::new(Hub::default());
        let id_a = Keypair::generate().peer_id();
        let id_b = Keypair::generate().peer_id();
        let mut a = node(&hub, id_a, &[id_b], vec![]);
        let mut b = node(&hub, id_b, &[id_a], vec![]);

        a.feed.send(sighting_of(id_b)).unwrap();
        wait_for(&mut a.status_rx, |s| {
            matches!(s, EngineStatus::PeerConnected { .. })
        })
        .await;

        let msg_id = a
            .engine
            .send_voice_message(id_b, vec![9u8; 128])
            .await
            .unwrap();
        let received = wait_for(&mut b.status_rx, |s| {
            matches!(s, EngineStatus::MessageReceived { id, .. } if *id == msg_id)
        })
        .await;
        match received {
            EngineStatus::MessageReceived { body, .. } => {
                assert!(matches!(body, MessageBody::Audio(_)));
            }
            _ => unreachable!(),
        }
    }
}
