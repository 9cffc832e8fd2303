//! PeerTalk engine: peer sessions, live talk fan-out, offline delivery.
//! Transport radios, audio codecs, and backend stores plug in at the seams;
//! hosts drive the engine and own the I/O.

pub mod audio;
pub mod backoff;
pub mod config;
pub mod delivery;
pub mod discovery;
pub mod engine;
pub mod identity;
pub mod link;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod store;
pub mod wire;

pub use audio::{AudioFrame, AudioPipeline, CaptureDevice, PlaybackDevice, TalkHoldId};
pub use config::EngineConfig;
pub use discovery::{Discovery, DiscoveryBackend, DiscoveryEvent, PeerSighting};
pub use engine::{EngineStatus, PeerTalkEngine};
pub use identity::{Keypair, PeerId, PublicKey};
pub use link::{Connector, FrameSink, FrameStream, LinkIo, TransportKind};
pub use message::{AudioRef, Message, MessageBody, MessageId};
pub use protocol::{Frame, PROTOCOL_VERSION};
pub use session::{TalkHold, TalkError};
pub use store::{AudioBlobStore, FriendStore, MessageHistory};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
