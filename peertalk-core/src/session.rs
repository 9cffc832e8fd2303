//! Session management: the per-peer connection state machine.
//!
//! One entry per peer moves through discovered → connecting → connected →
//! disconnected, driven by discovery events, link events, and the liveness
//! sweeper. The peer table is the only shared state here, and it is locked
//! per peer: two peers' transitions never wait on each other.
//!
//! The session also owns the talk-hold lifecycle: while a hold is active,
//! captured frames fan out to every connected peer, and peers that connect
//! mid-hold join the fan-out for subsequent frames only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audio::{AudioFrame, AudioPipeline, CaptureError, TalkHoldId};
use crate::backoff;
use crate::config::EngineConfig;
use crate::delivery::DeliverySignal;
use crate::discovery::DiscoveryEvent;
use crate::engine::EngineStatus;
use crate::identity::PeerId;
use crate::link::{Connector, Link, LinkEvent, LinkIo, SendError, TransportKind};
use crate::protocol::Frame;
use crate::store::FriendStore;

/// Inbound link events buffered between link tasks and the session loop.
const LINK_EVENT_BUFFER: usize = 256;

/// Where a peer stands. Peers the session has never heard of are simply
/// absent from the table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerPhase {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// One press-to-talk interaction. `participants` records everyone who was
/// in the fan-out at any point; sealed (immutable) once `ended_at` is set.
#[derive(Debug, Clone)]
pub struct TalkHold {
    pub id: TalkHoldId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub participants: HashSet<PeerId>,
}

#[derive(Debug, thiserror::Error)]
pub enum TalkError {
    #[error("a talk hold is already active")]
    HoldActive,
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

struct PeerEntry {
    phase: PeerPhase,
    kind: Option<TransportKind>,
    link: Option<Link>,
    /// Incarnation counter; events stamped with an older epoch are stale.
    epoch: u64,
    connect_attempts: u32,
    last_inbound: Instant,
    probe_deadline: Option<Instant>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            phase: PeerPhase::Discovered,
            kind: None,
            link: None,
            epoch: 0,
            connect_attempts: 0,
            last_inbound: Instant::now(),
            probe_deadline: None,
        }
    }
}

struct ActiveHold {
    hold: TalkHold,
    /// Links currently receiving this hold's frames. Mutated as peers come
    /// and go; a mid-hold joiner only sees frames produced after joining.
    fanout: HashMap<PeerId, Link>,
}

/// Owns the peer table, all link lifecycles, and the active talk hold.
pub struct SessionManager {
    cfg: EngineConfig,
    local: PeerId,
    connector: Arc<dyn Connector>,
    friends: Arc<dyn FriendStore>,
    audio: Arc<AudioPipeline>,
    peers: StdMutex<HashMap<PeerId, Arc<Mutex<PeerEntry>>>>,
    link_events: mpsc::Sender<LinkEvent>,
    delivery: mpsc::UnboundedSender<DeliverySignal>,
    status: mpsc::UnboundedSender<EngineStatus>,
    hold: Mutex<Option<ActiveHold>>,
    epochs: AtomicU64,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        local: PeerId,
        connector: Arc<dyn Connector>,
        friends: Arc<dyn FriendStore>,
        audio: Arc<AudioPipeline>,
        status: mpsc::UnboundedSender<EngineStatus>,
        delivery: mpsc::UnboundedSender<DeliverySignal>,
    ) -> (Arc<Self>, mpsc::Receiver<LinkEvent>) {
        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_BUFFER);
        let session = Arc::new(Self {
            cfg,
            local,
            connector,
            friends,
            audio,
            peers: StdMutex::new(HashMap::new()),
            link_events: link_tx,
            delivery,
            status,
            hold: Mutex::new(None),
            epochs: AtomicU64::new(1),
        });
        (session, link_rx)
    }

    /// Run the event loop and the liveness sweeper.
    pub fn spawn(
        self: &Arc<Self>,
        mut discovery_rx: mpsc::Receiver<DiscoveryEvent>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.liveness_loop().await });

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = discovery_rx.recv() => match ev {
                        Some(ev) => this.on_discovery_event(ev).await,
                        None => break,
                    },
                    ev = link_rx.recv() => match ev {
                        Some(ev) => this.on_link_event(ev).await,
                        None => break,
                    },
                }
            }
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    fn entry_for(&self, peer: PeerId) -> Arc<Mutex<PeerEntry>> {
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .entry(peer)
            .or_insert_with(|| Arc::new(Mutex::new(PeerEntry::new())))
            .clone()
    }

    fn entries(&self) -> Vec<(PeerId, Arc<Mutex<PeerEntry>>)> {
        self.peers
            .lock()
            .expect("peer table lock poisoned")
            .iter()
            .map(|(p, e)| (*p, e.clone()))
            .collect()
    }

    fn emit_status(&self, status: EngineStatus) {
        let _ = self.status.send(status);
    }

    /// Links currently connected, for fan-out snapshots and drains.
    pub async fn connected_links(&self) -> HashMap<PeerId, Link> {
        let mut out = HashMap::new();
        for (peer, entry) in self.entries() {
            let en = entry.lock().await;
            if en.phase == PeerPhase::Connected {
                if let Some(link) = &en.link {
                    out.insert(peer, link.clone());
                }
            }
        }
        out
    }

    pub async fn link_for(&self, peer: PeerId) -> Option<Link> {
        let entry = self.entry_for(peer);
        let en = entry.lock().await;
        match en.phase {
            PeerPhase::Connected => en.link.clone(),
            _ => None,
        }
    }

    pub async fn reachable_count(&self) -> usize {
        self.connected_links().await.len()
    }

    async fn emit_reachable_count(&self) {
        let count = self.reachable_count().await;
        self.emit_status(EngineStatus::ReachablePeers(count));
    }

    // ---- discovery ----------------------------------------------------

    async fn on_discovery_event(self: &Arc<Self>, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Sighted(s) => {
                if s.peer == self.local {
                    return;
                }
                // Every sighting lands the peer in the table as discovered;
                // only friends are dialed, and only when the policy says so.
                let entry = self.entry_for(s.peer);
                if !self.cfg.auto_connect || !self.friends.is_friend(s.peer).await {
                    debug!(peer = %s.peer, "sighted, not auto-connecting");
                    return;
                }
                let mut en = entry.lock().await;
                match en.phase {
                    PeerPhase::Connecting | PeerPhase::Connected => {}
                    PeerPhase::Discovered | PeerPhase::Disconnected => {
                        en.phase = PeerPhase::Connecting;
                        en.kind = Some(s.kind);
                        en.connect_attempts = 0;
                        en.epoch = self.next_epoch();
                        let epoch = en.epoch;
                        drop(en);
                        let this = self.clone();
                        tokio::spawn(async move {
                            this.connect_with_backoff(s.peer, s.kind, epoch).await;
                        });
                    }
                }
            }
            DiscoveryEvent::Lost { peer, .. } => {
                // Out of sight only matters for peers we are not connected
                // to; link liveness governs the rest.
                let known = self
                    .peers
                    .lock()
                    .expect("peer table lock poisoned")
                    .get(&peer)
                    .cloned();
                if let Some(entry) = known {
                    let mut en = entry.lock().await;
                    if en.phase == PeerPhase::Discovered {
                        en.phase = PeerPhase::Disconnected;
                    }
                }
            }
            DiscoveryEvent::TransportUnavailable { kind, reason } => {
                warn!(kind = %kind, "transport unavailable: {reason}");
                self.emit_status(EngineStatus::TransportUnavailable { kind, reason });
            }
        }
    }

    async fn connect_with_backoff(self: &Arc<Self>, peer: PeerId, kind: TransportKind, epoch: u64) {
        loop {
            match self.connector.connect(peer, kind).await {
                Ok(io) => {
                    self.install_link(peer, kind, io, Some(epoch)).await;
                    return;
                }
                Err(e) => {
                    let entry = self.entry_for(peer);
                    let mut en = entry.lock().await;
                    if en.epoch != epoch || en.phase != PeerPhase::Connecting {
                        return; // superseded by a newer transition
                    }
                    en.connect_attempts += 1;
                    let attempt = en.connect_attempts;
                    if attempt >= self.cfg.connect_attempt_ceiling {
                        debug!(peer = %peer, "connect ceiling reached, awaiting fresh sighting: {e}");
                        en.phase = PeerPhase::Discovered;
                        en.connect_attempts = 0;
                        return;
                    }
                    drop(en);
                    let delay = {
                        let mut rng = rand::thread_rng();
                        backoff::with_jitter(
                            backoff::connect_delay(
                                attempt - 1,
                                self.cfg.connect_backoff_base,
                                self.cfg.connect_backoff_cap,
                            ),
                            &mut rng,
                        )
                    };
                    debug!(peer = %peer, attempt, ?delay, "connect failed, backing off: {e}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // ---- links --------------------------------------------------------

    /// Install a handshaken connection as this peer's link. Used both for
    /// outbound connects and for connections accepted by the host listener.
    /// Returns false if the connection was superseded or a link already
    /// exists (the io is dropped; at most one link per peer).
    pub async fn install_link(
        self: &Arc<Self>,
        peer: PeerId,
        kind: TransportKind,
        io: LinkIo,
        owner_epoch: Option<u64>,
    ) -> bool {
        let entry = self.entry_for(peer);
        let mut en = entry.lock().await;
        if let Some(owner) = owner_epoch {
            if en.epoch != owner {
                debug!(peer = %peer, "connect result superseded, dropping connection");
                return false;
            }
        }
        if en.link.is_some() {
            debug!(peer = %peer, "already linked, dropping duplicate connection");
            return false;
        }
        let epoch = self.next_epoch();
        let link = Link::spawn(
            peer,
            kind,
            epoch,
            io,
            self.cfg.link_send_buffer,
            self.cfg.link_write_retries,
            self.link_events.clone(),
        );
        en.epoch = epoch;
        en.phase = PeerPhase::Connected;
        en.kind = Some(kind);
        en.link = Some(link.clone());
        en.connect_attempts = 0;
        en.last_inbound = Instant::now();
        en.probe_deadline = None;
        drop(en);

        info!(peer = %peer, kind = %kind, "peer connected");
        self.friends.record_connection(peer, kind, Utc::now()).await;
        let _ = self.delivery.send(DeliverySignal::PeerReady {
            peer,
            link: link.clone(),
        });
        self.emit_status(EngineStatus::PeerConnected { peer, kind });
        self.emit_reachable_count().await;

        let mut hold = self.hold.lock().await;
        if let Some(active) = hold.as_mut() {
            active.hold.participants.insert(peer);
            active.fanout.insert(peer, link);
        }
        true
    }

    async fn on_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Inbound { peer, epoch, frame } => {
                let link = {
                    let entry = self.entry_for(peer);
                    let mut en = entry.lock().await;
                    if en.epoch != epoch {
                        return; // frame from a torn-down link
                    }
                    en.last_inbound = Instant::now();
                    en.probe_deadline = None;
                    en.link.clone()
                };
                self.dispatch_frame(peer, link, frame).await;
            }
            LinkEvent::Closed { peer, epoch } => {
                self.disconnect_peer(peer, epoch, "link closed").await;
            }
        }
    }

    async fn dispatch_frame(self: &Arc<Self>, peer: PeerId, link: Option<Link>, frame: Frame) {
        match frame {
            Frame::Heartbeat { .. } | Frame::ProbeAck { .. } => {
                // Activity already recorded; nothing else to do.
            }
            Frame::Probe { .. } => {
                if let Some(link) = link {
                    if let Err(e) = link.send(Frame::ProbeAck {
                        peer_id: self.local,
                    }) {
                        debug!(peer = %peer, "probe ack not sent: {e}");
                    }
                }
            }
            Frame::Audio(audio_frame) => {
                self.audio.render_inbound(peer, &audio_frame);
            }
            Frame::Delivery {
                message_id,
                sender,
                body,
                created_at,
                ..
            } => {
                // Receipt-ack before any user-level handling; this is the
                // sender's delivery confirmation, not a read-receipt.
                if let Some(link) = link {
                    match link.send(Frame::DeliveryAck { message_id }) {
                        Ok(()) | Err(SendError::Backpressure) => {}
                        Err(e) => debug!(peer = %peer, "delivery ack not sent: {e}"),
                    }
                }
                self.emit_status(EngineStatus::MessageReceived {
                    id: message_id,
                    from: sender,
                    body,
                    sent_at: created_at,
                });
            }
            Frame::DeliveryAck { message_id } => {
                let _ = self.delivery.send(DeliverySignal::AckReceived { peer, message_id });
            }
            Frame::Goodbye { .. } => {
                let entry = self.entry_for(peer);
                let epoch = entry.lock().await.epoch;
                self.disconnect_peer(peer, epoch, "peer left").await;
            }
            Frame::Beacon { .. } | Frame::BeaconReply { .. } => {
                debug!(peer = %peer, "discovery frame on a link, ignoring");
            }
        }
    }

    async fn disconnect_peer(self: &Arc<Self>, peer: PeerId, epoch: u64, reason: &str) {
        let entry = self.entry_for(peer);
        let mut en = entry.lock().await;
        if en.epoch != epoch {
            return; // stale event from an old incarnation
        }
        let Some(link) = en.link.take() else {
            en.phase = PeerPhase::Disconnected;
            return;
        };
        link.close();
        let kind = en.kind;
        en.phase = PeerPhase::Disconnected;
        en.epoch = self.next_epoch();
        en.probe_deadline = None;
        drop(en);

        info!(peer = %peer, kind = ?kind, "peer disconnected: {reason}");
        let _ = self.delivery.send(DeliverySignal::PeerGone { peer });
        self.emit_status(EngineStatus::PeerDisconnected { peer });
        self.emit_reachable_count().await;

        let mut hold = self.hold.lock().await;
        if let Some(active) = hold.as_mut() {
            active.fanout.remove(&peer);
        }
    }

    // ---- liveness -----------------------------------------------------

    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.liveness_sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for (peer, entry) in self.entries() {
                let action = {
                    let mut en = entry.lock().await;
                    if en.phase != PeerPhase::Connected {
                        continue;
                    }
                    let Some(link) = en.link.clone() else {
                        continue;
                    };
                    if let Some(deadline) = en.probe_deadline {
                        if Instant::now() >= deadline {
                            Some((en.epoch, None))
                        } else {
                            None
                        }
                    } else if en.last_inbound.elapsed() >= self.cfg.heartbeat_interval {
                        en.probe_deadline = Some(Instant::now() + self.cfg.probe_timeout);
                        Some((0, Some((link, true))))
                    } else {
                        Some((0, Some((link, false))))
                    }
                };
                match action {
                    Some((epoch, None)) => {
                        self.disconnect_peer(peer, epoch, "liveness probe timed out")
                            .await;
                    }
                    Some((_, Some((link, probe)))) => {
                        let frame = if probe {
                            debug!(peer = %peer, "no inbound activity, probing");
                            Frame::Probe {
                                peer_id: self.local,
                            }
                        } else {
                            Frame::Heartbeat {
                                peer_id: self.local,
                            }
                        };
                        if let Err(e) = link.send(frame) {
                            debug!(peer = %peer, "liveness frame not sent: {e}");
                        }
                    }
                    None => {}
                }
            }
        }
    }

    // ---- talk holds ---------------------------------------------------

    /// Begin a talk hold. Succeeds with zero reachable peers (local
    /// monitoring); that case surfaces `NoReachablePeers` once.
    pub async fn press_talk(self: &Arc<Self>) -> Result<TalkHoldId, TalkError> {
        let mut hold = self.hold.lock().await;
        if hold.is_some() {
            return Err(TalkError::HoldActive);
        }
        let id = TalkHoldId::new();
        let frames = self.audio.begin_capture(id).await?;
        let fanout = self.connected_links().await;
        if fanout.is_empty() {
            self.emit_status(EngineStatus::NoReachablePeers);
        }
        let talk_hold = TalkHold {
            id,
            started_at: Utc::now(),
            ended_at: None,
            participants: fanout.keys().copied().collect(),
        };
        info!(hold = %id, peers = fanout.len(), "talk hold started");
        *hold = Some(ActiveHold {
            hold: talk_hold,
            fanout,
        });
        drop(hold);

        let this = self.clone();
        tokio::spawn(async move { this.forward_frames(frames).await });
        Ok(id)
    }

    /// End the active hold. Capture is sealed before this returns; the
    /// sealed hold is handed back for the caller's records. Idempotent —
    /// releasing with no active hold returns `None`.
    pub async fn release_talk(self: &Arc<Self>) -> Option<TalkHold> {
        let taken = self.hold.lock().await.take();
        let Some(mut active) = taken else {
            return None;
        };
        self.audio.end_capture().await;
        active.hold.ended_at = Some(Utc::now());
        info!(hold = %active.hold.id, "talk hold ended");
        Some(active.hold)
    }

    async fn forward_frames(self: Arc<Self>, mut frames: mpsc::Receiver<AudioFrame>) {
        while let Some(frame) = frames.recv().await {
            let targets: Vec<(PeerId, Link)> = {
                let hold = self.hold.lock().await;
                match hold.as_ref() {
                    Some(active) if active.hold.id == frame.hold => active
                        .fanout
                        .iter()
                        .map(|(p, l)| (*p, l.clone()))
                        .collect(),
                    // Hold released (or replaced): stop emitting buffered frames.
                    _ => break,
                }
            };
            for (peer, link) in targets {
                match link.send(Frame::Audio(frame.clone())) {
                    Ok(()) => {}
                    Err(SendError::Backpressure) => {
                        debug!(peer = %peer, seq = frame.sequence, "audio frame dropped: backpressure");
                    }
                    Err(_) => {
                        // Link on its way out; its Closed event cleans up.
                    }
                }
            }
        }
    }

    /// Close every link, saying goodbye where the buffer allows.
    pub async fn shutdown(self: &Arc<Self>) {
        for (peer, link) in self.connected_links().await {
            let _ = link.send(Frame::Goodbye {
                peer_id: self.local,
            });
            link.close();
            let entry = self.entry_for(peer);
            let mut en = entry.lock().await;
            en.link = None;
            en.phase = PeerPhase::Disconnected;
            en.epoch = self.next_epoch();
        }
    }
}
