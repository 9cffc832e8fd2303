//! Links: one live transport connection to one peer.
//!
//! A `Link` wraps handshaken transport halves (`FrameSink`/`FrameStream`,
//! provided by the host) with a writer task and a reader task. The writer
//! owns the bounded outbound buffer and the degraded-retry policy; the
//! reader pushes inbound frames to the session. The session is the sole
//! owner of link lifecycles and holds at most one link per peer.

use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::identity::PeerId;
use crate::protocol::Frame;

/// Pause between retries while a link is degraded.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The transport class a link runs over. Radios differ; the engine does not.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Bluetooth,
    WifiDirect,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Bluetooth => write!(f, "bluetooth"),
            TransportKind::WifiDirect => write!(f, "wifi-direct"),
        }
    }
}

/// Link lifecycle. A `Link` object exists from the moment its handshake
/// succeeded, so it starts in `Ready`; the connecting phase lives in the
/// session's peer state machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkState {
    Ready,
    Degraded,
    Closed,
}

/// Write half of a handshaken transport connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: &Frame) -> Result<(), LinkIoError>;
    async fn close(&mut self);
}

/// Read half of a handshaken transport connection. `next` returning
/// `Ok(None)` means the peer closed cleanly.
#[async_trait]
pub trait FrameStream: Send {
    async fn next(&mut self) -> Result<Option<Frame>, LinkIoError>;
}

/// Both halves, as handed over by a connector or listener after handshake.
pub struct LinkIo {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkIoError {
    /// Worth retrying on the same connection (buffer pressure, EINTR-class).
    #[error("transient link i/o error: {0}")]
    Transient(String),
    /// The connection is gone.
    #[error("link i/o failed: {0}")]
    Fatal(String),
}

/// Opens transport connections to peers the host knows how to reach.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer: PeerId, kind: TransportKind) -> Result<LinkIo, ConnectError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("transport {0} unavailable")]
    TransportUnavailable(TransportKind),
    #[error("connect failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The bounded outbound buffer is full; the caller must slow or drop.
    #[error("link send buffer full")]
    Backpressure,
    #[error("link closed")]
    Closed,
    #[error("transport write failed: {0}")]
    Io(String),
}

/// What link tasks report to the session. `epoch` identifies the link
/// incarnation so events from a torn-down link cannot affect its successor.
#[derive(Debug)]
pub enum LinkEvent {
    Inbound {
        peer: PeerId,
        epoch: u64,
        frame: Frame,
    },
    Closed {
        peer: PeerId,
        epoch: u64,
    },
}

enum Outbound {
    Fire(Frame),
    Acked(Frame, oneshot::Sender<Result<(), SendError>>),
}

/// Handle to one live link. Cheap to clone; all clones drive the same
/// writer/reader pair.
#[derive(Clone)]
pub struct Link {
    peer: PeerId,
    kind: TransportKind,
    epoch: u64,
    state: Arc<StdMutex<LinkState>>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("kind", &self.kind)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Wrap handshaken transport halves in writer/reader tasks.
    pub fn spawn(
        peer: PeerId,
        kind: TransportKind,
        epoch: u64,
        io: LinkIo,
        send_buffer: usize,
        write_retries: u32,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let state = Arc::new(StdMutex::new(LinkState::Ready));
        let (outbound_tx, outbound_rx) = mpsc::channel(send_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(writer_loop(
            peer,
            epoch,
            io.sink,
            outbound_rx,
            shutdown_rx.clone(),
            state.clone(),
            write_retries,
            events.clone(),
        ));
        tokio::spawn(reader_loop(peer, epoch, io.stream, shutdown_rx, events));

        Self {
            peer,
            kind,
            epoch,
            state,
            outbound: outbound_tx,
            shutdown: Arc::new(shutdown_tx),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().expect("link state lock poisoned")
    }

    /// Queue a frame without waiting for the write. Used for live audio and
    /// liveness traffic, where dropping beats stalling.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        if self.state() == LinkState::Closed {
            return Err(SendError::Closed);
        }
        self.outbound
            .try_send(Outbound::Fire(frame))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Queue a frame and wait until the transport write completed. Used by
    /// the delivery path, which must not advance past an unconfirmed send.
    pub async fn send_acked(&self, frame: Frame) -> Result<(), SendError> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Acked(frame, tx))
            .await
            .map_err(|_| SendError::Closed)?;
        rx.await.map_err(|_| SendError::Closed)?
    }

    /// Tear the link down. Idempotent and safe from any state; queued acked
    /// sends resolve with `SendError::Closed`.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[allow(clippy::too_many_arguments)]
async fn writer_loop(
    peer: PeerId,
    epoch: u64,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<StdMutex<LinkState>>,
    write_retries: u32,
    events: mpsc::Sender<LinkEvent>,
) {
    loop {
        let out = tokio::select! {
            _ = shutdown.changed() => break,
            o = rx.recv() => match o {
                Some(o) => o,
                None => break,
            },
        };
        let (frame, ack) = match out {
            Outbound::Fire(f) => (f, None),
            Outbound::Acked(f, tx) => (f, Some(tx)),
        };

        let mut attempts = 0u32;
        let result = loop {
            let sent = tokio::select! {
                _ = shutdown.changed() => break Err(SendError::Closed),
                r = sink.send(&frame) => r,
            };
            match sent {
                Ok(()) => {
                    let mut s = state.lock().expect("link state lock poisoned");
                    if *s == LinkState::Degraded {
                        *s = LinkState::Ready;
                    }
                    break Ok(());
                }
                Err(LinkIoError::Transient(e)) if attempts < write_retries => {
                    attempts += 1;
                    *state.lock().expect("link state lock poisoned") = LinkState::Degraded;
                    debug!(peer = %peer, attempt = attempts, "transient write error: {e}");
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
                Err(e) => break Err(SendError::Io(e.to_string())),
            }
        };

        let failed = result.is_err();
        if let Some(tx) = ack {
            let _ = tx.send(result);
        }
        if failed {
            break;
        }
    }

    sink.close().await;
    *state.lock().expect("link state lock poisoned") = LinkState::Closed;
    // Fail anything still queued rather than leaving senders waiting.
    rx.close();
    while let Ok(out) = rx.try_recv() {
        if let Outbound::Acked(_, tx) = out {
            let _ = tx.send(Err(SendError::Closed));
        }
    }
    let _ = events.send(LinkEvent::Closed { peer, epoch }).await;
}

async fn reader_loop(
    peer: PeerId,
    epoch: u64,
    mut stream: Box<dyn FrameStream>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::Sender<LinkEvent>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            n = stream.next() => n,
        };
        match next {
            Ok(Some(frame)) => {
                if events
                    .send(LinkEvent::Inbound { peer, epoch, frame })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => break,
            Err(LinkIoError::Transient(e)) => {
                debug!(peer = %peer, "transient read error: {e}");
            }
            Err(LinkIoError::Fatal(e)) => {
                debug!(peer = %peer, "link read failed: {e}");
                break;
            }
        }
    }
    let _ = events.send(LinkEvent::Closed { peer, epoch }).await;
}


#[cfg(test)]
mod tests {
    use super::testio::memory_pair;
    use super::*;
    use crate::identity::Keypair;
    use std::sync::atomic::Ordering;

    fn heartbeat() -> Frame {
        Frame::Heartbeat {
            peer_id: Keypair::generate().peer_id(),
        }
    }

    #[tokio::test]
    async fn send_acked_reaches_peer() {
        let (a, mut b, _faults) = memory_pair();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let peer = Keypair::generate().peer_id();
        let link = Link::spawn(peer, TransportKind::WifiDirect, 1, a, 8, 3, events_tx);

        link.send_acked(heartbeat()).await.unwrap();
        let frame = b.stream.next().await.unwrap().unwrap();
        assert!(matches!(frame, Frame::Heartbeat { .. }));
        assert_eq!(link.state(), LinkState::Ready);
    }

    #[tokio::test]
    async fn transient_faults_degrade_then_recover() {
        let (a, mut b, faults) = memory_pair();
        faults.transient.store(2, Ordering::SeqCst);
        let (events_tx, _events_rx) = mpsc::channel(16);
        let peer = Keypair::generate().peer_id();
        let link = Link::spawn(peer, TransportKind::Bluetooth, 1, a, 8, 3, events_tx);

        link.send_acked(heartbeat()).await.unwrap();
        assert!(b.stream.next().await.unwrap().is_some());
        assert_eq!(link.state(), LinkState::Ready);
    }

    #[tokio::test]
    async fn exhausted_retries_close_the_link() {
        let (a, _b, faults) = memory_pair();
        faults.fatal.store(true, Ordering::SeqCst);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let peer = Keypair::generate().peer_id();
        let link = Link::spawn(peer, TransportKind::WifiDirect, 7, a, 8, 3, events_tx);

        assert!(matches!(
            link.send_acked(heartbeat()).await,
            Err(SendError::Io(_))
        ));
        // The writer reports the closure with this link's epoch.
        loop {
            match events_rx.recv().await.unwrap() {
                LinkEvent::Closed { epoch, .. } => {
                    assert_eq!(epoch, 7);
                    break;
                }
                LinkEvent::Inbound { .. } => {}
            }
        }
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn full_buffer_reports_backpressure() {
        let (a, _b, faults) = memory_pair();
        faults.stall.store(true, Ordering::SeqCst);
        let (events_tx, _events_rx) = mpsc::channel(16);
        let peer = Keypair::generate().peer_id();
        let link = Link::spawn(peer, TransportKind::WifiDirect, 1, a, 2, 3, events_tx);

        // Writer takes one frame in flight; the buffer holds two more.
        let mut saw_backpressure = false;
        for _ in 0..8 {
            if matches!(link.send(heartbeat()), Err(SendError::Backpressure)) {
                saw_backpressure = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(saw_backpressure, "bounded buffer never pushed back");
        faults.stall.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_pending_sends() {
        let (a, _b, faults) = memory_pair();
        faults.stall.store(true, Ordering::SeqCst);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let peer = Keypair::generate().peer_id();
        let link = Link::spawn(peer, TransportKind::WifiDirect, 3, a, 4, 3, events_tx);

        let pending = {
            let link = link.clone();
            tokio::spawn(async move { link.send_acked(heartbeat()).await })
        };
        tokio::task::yield_now().await;

        link.close();
        link.close();

        assert!(matches!(
            pending.await.unwrap(),
            Err(SendError::Closed) | Err(SendError::Io(_))
        ));
        loop {
            if let LinkEvent::Closed { epoch, .. } = events_rx.recv().await.unwrap() {
                assert_eq!(epoch, 3);
                break;
            }
        }
        assert_eq!(link.state(), LinkState::Closed);
        assert!(matches!(link.send(heartbeat()), Err(SendError::Closed)));
    }

    #[tokio::test]
    async fn peer_close_ends_the_stream() {
        let (a, b, _faults) = memory_pair();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let peer = Keypair::generate().peer_id();
        let _link = Link::spawn(peer, TransportKind::WifiDirect, 9, a, 8, 3, events_tx);

        drop(b); // peer goes away
        loop {
            if let LinkEvent::Closed { peer: p, epoch } = events_rx.recv().await.unwrap() {
                assert_eq!(p, peer);
                assert_eq!(epoch, 9);
                break;
            }
        }
    }
}
