//! Delivery coordination: drain per-peer queues when peers become reachable.
//!
//! One drain per peer at a time, strictly head-to-tail: the next message is
//! not sent until the previous one's receipt-ack arrived. A link drop
//! mid-drain puts the in-flight message back at the head and stops the
//! drain until the peer reconnects. Different peers drain concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::EngineStatus;
use crate::identity::PeerId;
use crate::link::Link;
use crate::message::MessageId;
use crate::protocol::Frame;
use crate::queue::{MessageQueue, RetryOutcome};
use crate::store::MessageHistory;

/// What the session tells the coordinator.
#[derive(Debug)]
pub enum DeliverySignal {
    /// The peer has a ready link: drain its queue (also nudged on enqueue
    /// while already connected).
    PeerReady { peer: PeerId, link: Link },
    /// The peer's link is gone; outstanding receipt waits can fail early.
    PeerGone { peer: PeerId },
    /// The peer's session layer confirmed receipt of a message.
    AckReceived { peer: PeerId, message_id: MessageId },
}

struct PendingAck {
    peer: PeerId,
    tx: oneshot::Sender<()>,
}

pub struct DeliveryCoordinator {
    queue: Arc<MessageQueue>,
    history: Arc<dyn MessageHistory>,
    status: mpsc::UnboundedSender<EngineStatus>,
    ack_timeout: Duration,
    pending: StdMutex<HashMap<MessageId, PendingAck>>,
    draining: StdMutex<HashSet<PeerId>>,
}

impl DeliveryCoordinator {
    pub fn new(
        queue: Arc<MessageQueue>,
        history: Arc<dyn MessageHistory>,
        status: mpsc::UnboundedSender<EngineStatus>,
        ack_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            history,
            status,
            ack_timeout,
            pending: StdMutex::new(HashMap::new()),
            draining: StdMutex::new(HashSet::new()),
        })
    }

    pub fn spawn(
        self: &Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<DeliverySignal>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                match signal {
                    DeliverySignal::PeerReady { peer, link } => {
                        if this.try_claim(peer) {
                            let drainer = this.clone();
                            tokio::spawn(async move { drainer.drain(peer, link).await });
                        }
                    }
                    DeliverySignal::PeerGone { peer } => {
                        // Fail outstanding receipt waits now instead of
                        // letting them ride out the ack timeout.
                        this.pending
                            .lock()
                            .expect("pending lock poisoned")
                            .retain(|_, p| p.peer != peer);
                    }
                    DeliverySignal::AckReceived { peer, message_id } => {
                        let pending = this
                            .pending
                            .lock()
                            .expect("pending lock poisoned")
                            .remove(&message_id);
                        match pending {
                            Some(p) if p.peer == peer => {
                                let _ = p.tx.send(());
                            }
                            Some(p) => {
                                // Ack from the wrong peer; put it back.
                                this.pending
                                    .lock()
                                    .expect("pending lock poisoned")
                                    .insert(message_id, p);
                            }
                            None => debug!(id = %message_id, "ack for unknown message"),
                        }
                    }
                }
            }
        })
    }

    fn try_claim(&self, peer: PeerId) -> bool {
        self.draining
            .lock()
            .expect("draining lock poisoned")
            .insert(peer)
    }

    async fn drain(self: Arc<Self>, peer: PeerId, link: Link) {
        loop {
            let stopped_on_failure = self.drain_once(peer, &link).await;
            self.draining
                .lock()
                .expect("draining lock poisoned")
                .remove(&peer);
            if stopped_on_failure || self.queue.pending_for(peer) == 0 {
                return;
            }
            // An enqueue raced with the flag clearing; pick it up.
            if !self.try_claim(peer) {
                return;
            }
        }
    }

    /// Send queued messages head-to-tail until the queue is empty or a
    /// transmission fails. Returns true when stopped on failure.
    async fn drain_once(&self, peer: PeerId, link: &Link) -> bool {
        while let Some(message) = self.queue.next_for(peer) {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .insert(message.id, PendingAck { peer, tx: ack_tx });

            let frame = Frame::Delivery {
                message_id: message.id,
                sender: message.sender,
                recipient: message.recipient,
                body: message.body.clone(),
                created_at: message.created_at,
            };
            let delivered = match link.send_acked(frame).await {
                Ok(()) => matches!(
                    tokio::time::timeout(self.ack_timeout, ack_rx).await,
                    Ok(Ok(()))
                ),
                Err(e) => {
                    debug!(peer = %peer, id = %message.id, "send failed: {e}");
                    false
                }
            };
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&message.id);

            if delivered {
                if let Some(done) = self.queue.mark_delivered(peer, message.id) {
                    info!(peer = %peer, id = %done.id, "message delivered");
                    let _ = self.status.send(EngineStatus::MessageDelivered {
                        id: done.id,
                        recipient: peer,
                    });
                    self.history.record_outcome(done).await;
                }
            } else {
                match self
                    .queue
                    .retry_or_fail(peer, message.id, "transmission failed")
                {
                    RetryOutcome::Requeued => {
                        debug!(peer = %peer, id = %message.id, "drain stopped, message back at head");
                    }
                    RetryOutcome::Failed(failed) => {
                        let reason = failed
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "transmission failed".into());
                        warn!(peer = %peer, id = %failed.id, "delivery failed terminally: {reason}");
                        let _ = self.status.send(EngineStatus::DeliveryFailed {
                            id: failed.id,
                            recipient: peer,
                            reason,
                        });
                        self.history.record_outcome(failed).await;
                    }
                }
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, PeerId};
    use crate::link::testio::{memory_pair, Faults};
    use crate::link::{FrameStream, LinkIo, TransportKind};
    use crate::message::{Message, MessageBody};
    use crate::store::testutil::RecordingHistory;
    use std::sync::atomic::Ordering;

    struct Rig {
        coordinator: Arc<DeliveryCoordinator>,
        signals: mpsc::UnboundedSender<DeliverySignal>,
        status_rx: mpsc::UnboundedReceiver<EngineStatus>,
        queue: Arc<MessageQueue>,
        history: Arc<RecordingHistory>,
    }

    fn rig(retry_ceiling: u32, ack_timeout: Duration) -> Rig {
        let queue = Arc::new(MessageQueue::new(retry_ceiling));
        let history = Arc::new(RecordingHistory::default());
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let coordinator = DeliveryCoordinator::new(
            queue.clone(),
            history.clone(),
            status_tx,
            ack_timeout,
        );
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let _ = coordinator.spawn(signals_rx);
        Rig {
            coordinator,
            signals: signals_tx,
            status_rx,
            queue,
            history,
        }
    }

    fn spawn_link(io: LinkIo, peer: PeerId) -> Link {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        // Keep the event channel alive; delivery tests route acks manually.
        tokio::spawn(async move { while events_rx.recv().await.is_some() {} });
        Link::spawn(peer, TransportKind::WifiDirect, 1, io, 8, 1, events_tx)
    }

    /// Emulate the remote session: record deliveries in order, ack each one
    /// (optionally flipping a fault before the ack goes back).
    fn run_remote(
        mut stream: Box<dyn FrameStream>,
        signals: mpsc::UnboundedSender<DeliverySignal>,
        peer: PeerId,
        received: Arc<StdMutex<Vec<MessageId>>>,
        fail_after: Option<(usize, Faults)>,
    ) {
        tokio::spawn(async move {
            let mut count = 0usize;
            while let Ok(Some(frame)) = stream.next().await {
                if let Frame::Delivery { message_id, .. } = frame {
                    count += 1;
                    received
                        .lock()
                        .expect("received lock poisoned")
                        .push(message_id);
                    if let Some((after, faults)) = &fail_after {
                        if count == *after {
                            faults.fatal.store(true, Ordering::SeqCst);
                        }
                    }
                    let _ = signals.send(DeliverySignal::AckReceived { peer, message_id });
                }
            }
        });
    }

    fn enqueue_texts(queue: &MessageQueue, from: PeerId, to: PeerId, n: usize) -> Vec<MessageId> {
        (0..n)
            .map(|i| queue.enqueue(Message::new(from, to, MessageBody::Text(format!("msg {i}")))))
            .collect()
    }

    #[tokio::test]
    async fn drains_fifo_and_records_outcomes() {
        let me = Keypair::generate().peer_id();
        let peer = Keypair::generate().peer_id();
        let mut r = rig(3, Duration::from_millis(500));
        let ids = enqueue_texts(&r.queue, me, peer, 3);

        let (a, b, _faults) = memory_pair();
        let link = spawn_link(a, peer);
        let received = Arc::new(StdMutex::new(Vec::new()));
        run_remote(b.stream, r.signals.clone(), peer, received.clone(), None);

        r.signals
            .send(DeliverySignal::PeerReady { peer, link })
            .unwrap();

        for expected in &ids {
            loop {
                match r.status_rx.recv().await.unwrap() {
                    EngineStatus::MessageDelivered { id, .. } => {
                        assert_eq!(id, *expected);
                        break;
                    }
                    other => panic!("unexpected status: {other:?}"),
                }
            }
        }
        assert_eq!(*received.lock().unwrap(), ids);
        assert_eq!(r.queue.pending_for(peer), 0);
        assert_eq!(r.history.outcomes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn link_drop_mid_drain_keeps_order_after_reconnect() {
        let me = Keypair::generate().peer_id();
        let peer = Keypair::generate().peer_id();
        let mut r = rig(5, Duration::from_millis(500));
        let ids = enqueue_texts(&r.queue, me, peer, 4);

        // First connection dies right after the first delivery is received.
        let (a, b, faults) = memory_pair();
        let link = spawn_link(a, peer);
        let received = Arc::new(StdMutex::new(Vec::new()));
        run_remote(
            b.stream,
            r.signals.clone(),
            peer,
            received.clone(),
            Some((1, faults)),
        );
        r.signals
            .send(DeliverySignal::PeerReady { peer, link })
            .unwrap();

        // Exactly the first message is delivered before the drop stops the drain.
        loop {
            if let EngineStatus::MessageDelivered { id, .. } = r.status_rx.recv().await.unwrap() {
                assert_eq!(id, ids[0]);
                break;
            }
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while r.queue.pending_for(peer) != 3 {
            assert!(tokio::time::Instant::now() < deadline, "drain never stopped");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Reconnect: the remaining three go out in the original order.
        let (a2, b2, _f2) = memory_pair();
        let link2 = spawn_link(a2, peer);
        run_remote(b2.stream, r.signals.clone(), peer, received.clone(), None);
        r.signals
            .send(DeliverySignal::PeerReady { peer, link: link2 })
            .unwrap();

        for expected in &ids[1..] {
            loop {
                if let EngineStatus::MessageDelivered { id, .. } = r.status_rx.recv().await.unwrap()
                {
                    assert_eq!(id, *expected);
                    break;
                }
            }
        }
        assert_eq!(*received.lock().unwrap(), ids);
        assert_eq!(r.queue.pending_for(peer), 0);
    }

    #[tokio::test]
    async fn retry_ceiling_fails_terminally_and_surfaces() {
        let me = Keypair::generate().peer_id();
        let peer = Keypair::generate().peer_id();
        let mut r = rig(2, Duration::from_millis(100));
        let ids = enqueue_texts(&r.queue, me, peer, 1);

        let (a, _b, faults) = memory_pair();
        faults.fatal.store(true, Ordering::SeqCst);
        let link = spawn_link(a, peer);

        // Each ready signal buys one failed attempt; past the ceiling the
        // message fails terminally instead of being silently dropped.
        for _ in 0..3 {
            r.signals
                .send(DeliverySignal::PeerReady {
                    peer,
                    link: link.clone(),
                })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        loop {
            match r.status_rx.recv().await.unwrap() {
                EngineStatus::DeliveryFailed { id, recipient, .. } => {
                    assert_eq!(id, ids[0]);
                    assert_eq!(recipient, peer);
                    break;
                }
                other => panic!("unexpected status: {other:?}"),
            }
        }
        assert_eq!(r.queue.pending_for(peer), 0);
        let outcomes = r.history.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].delivery_state,
            crate::message::DeliveryState::Failed
        );
    }

    #[tokio::test]
    async fn missing_ack_requeues_at_head() {
        let me = Keypair::generate().peer_id();
        let peer = Keypair::generate().peer_id();
        let mut r = rig(5, Duration::from_millis(40));
        let ids = enqueue_texts(&r.queue, me, peer, 2);

        // Remote receives but never acks.
        let (a, mut b, _faults) = memory_pair();
        let link = spawn_link(a, peer);
        tokio::spawn(async move { while let Ok(Some(_)) = b.stream.next().await {} });

        r.signals
            .send(DeliverySignal::PeerReady { peer, link })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        // Nothing delivered; both messages still owned by the queue, with
        // the first still at the head.
        assert!(r.status_rx.try_recv().is_err());
        assert_eq!(r.queue.pending_for(peer), 2);
        assert_eq!(r.queue.next_for(peer).unwrap().id, ids[0]);
        let _ = r.coordinator; // keep the rig alive to the end
    }

    #[tokio::test]
    async fn stray_ack_is_ignored() {
        let peer = Keypair::generate().peer_id();
        let r = rig(3, Duration::from_millis(100));
        r.signals
            .send(DeliverySignal::AckReceived {
                peer,
                message_id: MessageId::new(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(r.queue.pending_for(peer), 0);
    }
}
