//! LAN discovery backend: UDP multicast beacons, sighting/lost events,
//! and the address book the TCP connector dials from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peertalk_core::discovery::{
    DiscoveryBackend, DiscoveryError, DiscoveryEvent, EventSink, PeerSighting,
};
use peertalk_core::{
    decode_frame, encode_frame, Frame, Keypair, PeerId, TransportKind, PROTOCOL_VERSION,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Multicast group for beacons (same subnet only).
const MULTICAST_GROUP: &str = "239.255.70.70";
/// How often we advertise ourselves.
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
/// A peer with no beacon for this long is reported lost.
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// Last known transport address per peer, fed by beacons and read by the
/// connector. Peers move between networks; the latest sighting wins.
#[derive(Default)]
pub struct AddrBook {
    inner: Mutex<HashMap<PeerId, SocketAddr>>,
}

impl AddrBook {
    pub fn insert(&self, peer: PeerId, addr: SocketAddr) {
        self.inner
            .lock()
            .expect("addr book lock poisoned")
            .insert(peer, addr);
    }

    pub fn get(&self, peer: PeerId) -> Option<SocketAddr> {
        self.inner
            .lock()
            .expect("addr book lock poisoned")
            .get(&peer)
            .copied()
    }
}

/// WiFi-side discovery over UDP multicast. One `scan` call runs beaconing,
/// receiving, and lost-peer sweeping until stopped.
pub struct LanDiscovery {
    keypair: Arc<Keypair>,
    discovery_port: u16,
    listen_port: u16,
    addr_book: Arc<AddrBook>,
}

impl LanDiscovery {
    pub fn new(
        keypair: Arc<Keypair>,
        discovery_port: u16,
        listen_port: u16,
        addr_book: Arc<AddrBook>,
    ) -> Self {
        Self {
            keypair,
            discovery_port,
            listen_port,
            addr_book,
        }
    }

    fn beacon_frame(&self) -> Frame {
        Frame::Beacon {
            protocol_version: PROTOCOL_VERSION,
            peer_id: self.keypair.peer_id(),
            public_key: self.keypair.public_key().clone(),
            listen_port: self.listen_port,
        }
    }

    fn reply_frame(&self) -> Frame {
        Frame::BeaconReply {
            protocol_version: PROTOCOL_VERSION,
            peer_id: self.keypair.peer_id(),
            public_key: self.keypair.public_key().clone(),
            listen_port: self.listen_port,
        }
    }
}

#[async_trait]
impl DiscoveryBackend for LanDiscovery {
    fn kind(&self) -> TransportKind {
        TransportKind::WifiDirect
    }

    async fn scan(
        &self,
        events: EventSink,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(), DiscoveryError> {
        let socket = make_multicast_socket(self.discovery_port)
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        let dest: SocketAddr = format!("{MULTICAST_GROUP}:{}", self.discovery_port)
            .parse()
            .map_err(|e| DiscoveryError::Unavailable(format!("multicast addr: {e}")))?;

        let beacon = encode_frame(&self.beacon_frame())
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;
        let reply = encode_frame(&self.reply_frame())
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;

        let my_id = self.keypair.peer_id();
        let mut last_seen: HashMap<PeerId, Instant> = HashMap::new();
        let mut beacon_ticker = tokio::time::interval(BEACON_INTERVAL);
        let mut sweep_ticker = tokio::time::interval(BEACON_INTERVAL);
        let mut buf = vec![0u8; 2048];

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = beacon_ticker.tick() => {
                    if let Err(e) = socket.send_to(&beacon, dest).await {
                        debug!("beacon send failed: {e}");
                    }
                }
                _ = sweep_ticker.tick() => {
                    let now = Instant::now();
                    let gone: Vec<PeerId> = last_seen
                        .iter()
                        .filter(|(_, &t)| now.duration_since(t) >= PEER_TIMEOUT)
                        .map(|(&p, _)| p)
                        .collect();
                    for peer in gone {
                        last_seen.remove(&peer);
                        events.push(DiscoveryEvent::Lost {
                            peer,
                            kind: TransportKind::WifiDirect,
                        });
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("discovery recv failed: {e}");
                            continue;
                        }
                    };
                    let Ok((frame, _)) = decode_frame(&buf[..n]) else { continue };
                    let (version, peer_id, listen_port, wants_reply) = match frame {
                        Frame::Beacon { protocol_version, peer_id, listen_port, .. } =>
                            (protocol_version, peer_id, listen_port, true),
                        Frame::BeaconReply { protocol_version, peer_id, listen_port, .. } =>
                            (protocol_version, peer_id, listen_port, false),
                        _ => continue,
                    };
                    if version != PROTOCOL_VERSION || peer_id == my_id {
                        continue;
                    }
                    self.addr_book
                        .insert(peer_id, SocketAddr::new(from.ip(), listen_port));
                    last_seen.insert(peer_id, Instant::now());
                    events.push(DiscoveryEvent::Sighted(PeerSighting {
                        peer: peer_id,
                        kind: TransportKind::WifiDirect,
                        quality: 0,
                        seen_at: chrono::Utc::now(),
                    }));
                    if wants_reply {
                        let _ = socket.send_to(&reply, from).await;
                    }
                }
            }
        }
        Ok(())
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    let group: std::net::Ipv4Addr = MULTICAST_GROUP
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    std_sock.join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}
