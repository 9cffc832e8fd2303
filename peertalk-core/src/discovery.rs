//! Discovery: scan configured transports and report peers coming and going.
//!
//! Backends own the actual radio loops (the daemon ships a UDP multicast
//! one); this module supervises them and funnels their events into the
//! session. Event production never blocks a backend: a full channel drops
//! the event with a warning instead of stalling the scan loop.

use std::collections::HashSet;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::identity::PeerId;
use crate::link::TransportKind;

/// A peer seen on a scanned transport.
#[derive(Debug, Clone)]
pub struct PeerSighting {
    pub peer: PeerId,
    pub kind: TransportKind,
    /// Opaque signal quality (RSSI dBm for radios, 0 where meaningless).
    pub quality: i16,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum DiscoveryEvent {
    Sighted(PeerSighting),
    Lost {
        peer: PeerId,
        kind: TransportKind,
    },
    /// The transport could not be activated (off, permission denied).
    /// Non-fatal; scanning continues on the other transports.
    TransportUnavailable {
        kind: TransportKind,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Non-blocking event producer handed to backends.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DiscoveryEvent>,
}

impl EventSink {
    pub fn push(&self, event: DiscoveryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!("discovery event dropped, consumer lagging: {ev:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// One transport's scan loop. `scan` runs until `stop` flips true; it
/// returns `Unavailable` if the transport cannot be activated at all.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    fn kind(&self) -> TransportKind;
    async fn scan(
        &self,
        events: EventSink,
        stop: watch::Receiver<bool>,
    ) -> Result<(), DiscoveryError>;
}

/// Supervises backend scan tasks. Start and stop are idempotent; stopping
/// never touches links that are already connected.
pub struct Discovery {
    backends: Vec<Arc<dyn DiscoveryBackend>>,
    events: mpsc::Sender<DiscoveryEvent>,
    scan: StdMutex<Option<watch::Sender<bool>>>,
}

impl Discovery {
    pub fn new(backends: Vec<Arc<dyn DiscoveryBackend>>, events: mpsc::Sender<DiscoveryEvent>) -> Self {
        Self {
            backends,
            events,
            scan: StdMutex::new(None),
        }
    }

    /// Start scan loops for the requested transports. A transport with no
    /// backend, or whose backend fails to activate, surfaces
    /// `TransportUnavailable`; the rest keep scanning.
    pub fn start_scanning(&self, kinds: &HashSet<TransportKind>) {
        let mut scan = self.scan.lock().expect("scan lock poisoned");
        if scan.is_some() {
            return; // already scanning
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let sink = EventSink {
            tx: self.events.clone(),
        };

        for &kind in kinds {
            let Some(backend) = self.backends.iter().find(|b| b.kind() == kind) else {
                sink.push(DiscoveryEvent::TransportUnavailable {
                    kind,
                    reason: "no backend for transport".into(),
                });
                continue;
            };
            let backend = backend.clone();
            let sink = sink.clone();
            let stop = stop_rx.clone();
            tokio::spawn(async move {
                debug!(kind = %kind, "scan started");
                if let Err(DiscoveryError::Unavailable(reason)) =
                    backend.scan(sink.clone(), stop).await
                {
                    sink.push(DiscoveryEvent::TransportUnavailable { kind, reason });
                }
                debug!(kind = %kind, "scan ended");
            });
        }
        *scan = Some(stop_tx);
    }

    /// Stop all scan loops. Idempotent; connected links are unaffected.
    pub fn stop_scanning(&self) {
        let mut scan = self.scan.lock().expect("scan lock poisoned");
        if let Some(stop) = scan.take() {
            let _ = stop.send(true);
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.lock().expect("scan lock poisoned").is_some()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use tokio::sync::Mutex;

    /// Backend driven by the test: forwards injected events until stopped.
    pub struct ScriptedBackend {
        kind: TransportKind,
        feed: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
    }

    impl ScriptedBackend {
        pub fn new(kind: TransportKind) -> (Arc<Self>, mpsc::UnboundedSender<DiscoveryEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    kind,
                    feed: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl DiscoveryBackend for ScriptedBackend {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn scan(
            &self,
            events: EventSink,
            mut stop: watch::Receiver<bool>,
        ) -> Result<(), DiscoveryError> {
            let mut feed = self
                .feed
                .lock()
                .await
                .take()
                .ok_or_else(|| DiscoveryError::Unavailable("scan already consumed".into()))?;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    ev = feed.recv() => match ev {
                        Some(ev) => events.push(ev),
                        None => break,
                    },
                }
            }
            Ok(())
        }
    }

    /// Backend whose transport can never be activated.
    pub struct DeadBackend(pub TransportKind);

    #[async_trait]
    impl DiscoveryBackend for DeadBackend {
        fn kind(&self) -> TransportKind {
            self.0
        }

        async fn scan(
            &self,
            _events: EventSink,
            _stop: watch::Receiver<bool>,
        ) -> Result<(), DiscoveryError> {
            Err(DiscoveryError::Unavailable("radio off".into()))
        }
    }
}
