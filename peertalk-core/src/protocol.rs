//! PeerTalk wire protocol: frame types and version.
//!
//! A single link multiplexes live audio and queued-message delivery; every
//! frame is tagged by kind (the enum discriminant) and length-prefixed by the
//! wire module, so receivers can route without peeking at payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::AudioFrame;
use crate::identity::{PeerId, PublicKey};
use crate::message::{MessageBody, MessageId};

/// Current protocol version. Checked in beacons and link handshakes.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire frame types. Encoding is bincode; framing is length-prefix
/// (see the wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Discovery: advertise presence on a scanned transport.
    Beacon {
        protocol_version: u8,
        peer_id: PeerId,
        public_key: PublicKey,
        listen_port: u16,
    },
    /// Response to a beacon: ack and advertise self.
    BeaconReply {
        protocol_version: u8,
        peer_id: PeerId,
        public_key: PublicKey,
        listen_port: u16,
    },
    /// Periodic liveness signal on an open link.
    Heartbeat { peer_id: PeerId },
    /// Explicit liveness probe, sent before declaring a silent peer lost.
    Probe { peer_id: PeerId },
    ProbeAck { peer_id: PeerId },
    /// Live audio during a talk hold.
    Audio(AudioFrame),
    /// Store-and-forward message delivery.
    Delivery {
        message_id: MessageId,
        sender: PeerId,
        recipient: PeerId,
        body: MessageBody,
        created_at: DateTime<Utc>,
    },
    /// Session-layer receipt for a `Delivery` frame (not a read-receipt).
    DeliveryAck { message_id: MessageId },
    /// Graceful link close.
    Goodbye { peer_id: PeerId },
}
