//! TCP link transport: listener for incoming connections, connector for
//! outbound ones, handshake and per-direction encrypted framing.
//!
//! Handshake: each side sends `version ++ peer_id ++ public_key` (49 bytes).
//! Both derive the pairwise session key via X25519; every frame after that
//! is ChaCha20-Poly1305 under a per-direction nonce counter.

use std::sync::Arc;

use async_trait::async_trait;
use peertalk_core::identity::{decrypt_frame, derive_session_key, encrypt_frame};
use peertalk_core::link::{ConnectError, Connector, FrameSink, FrameStream, LinkIo, LinkIoError};
use peertalk_core::{
    decode_frame, encode_frame, Frame, Keypair, PeerId, PeerTalkEngine, PublicKey, TransportKind,
    PROTOCOL_VERSION,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::discovery::AddrBook;

const HANDSHAKE_SIZE: usize = 1 + 16 + 32; // version + peer_id + public_key
const LEN_SIZE: usize = 4;
/// Ciphertext cap: the wire frame cap plus AEAD overhead headroom.
const MAX_CIPHER_LEN: u32 = 2 * 1024 * 1024;

/// Dial peers at the addresses discovery has seen them on.
pub struct TcpConnector {
    keypair: Arc<Keypair>,
    addr_book: Arc<AddrBook>,
}

impl TcpConnector {
    pub fn new(keypair: Arc<Keypair>, addr_book: Arc<AddrBook>) -> Self {
        Self { keypair, addr_book }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: PeerId, kind: TransportKind) -> Result<LinkIo, ConnectError> {
        if kind != TransportKind::WifiDirect {
            return Err(ConnectError::TransportUnavailable(kind));
        }
        let addr = self
            .addr_book
            .get(peer)
            .ok_or_else(|| ConnectError::Failed(format!("no known address for {peer}")))?;
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ConnectError::Failed(format!("{addr}: {e}")))?;

        send_hello(&mut stream, &self.keypair)
            .await
            .map_err(|e| ConnectError::Failed(e.to_string()))?;
        let (remote_id, session_key) = read_hello(&mut stream, &self.keypair)
            .await
            .map_err(|e| ConnectError::Failed(e.to_string()))?;
        if remote_id != peer {
            return Err(ConnectError::Failed(format!(
                "dialed {peer} but {remote_id} answered"
            )));
        }
        debug!(peer = %peer, %addr, "outbound link handshake complete");
        Ok(link_io(stream, session_key))
    }
}

/// Accept incoming links and hand them to the engine. The engine applies
/// the admission policy (friends only) and the one-link-per-peer rule.
pub async fn run_listener(
    port: u16,
    keypair: Arc<Keypair>,
    engine: Arc<PeerTalkEngine>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "link listener up");
    loop {
        let (stream, addr) = listener.accept().await?;
        let keypair = keypair.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            match accept_handshake(stream, &keypair).await {
                Ok((peer, io)) => {
                    if !engine.accept_link(peer, TransportKind::WifiDirect, io).await {
                        debug!(peer = %peer, %addr, "incoming link not accepted");
                    }
                }
                Err(e) => warn!(%addr, "incoming handshake failed: {e}"),
            }
        });
    }
}

async fn accept_handshake(
    mut stream: TcpStream,
    keypair: &Keypair,
) -> std::io::Result<(PeerId, LinkIo)> {
    let (peer, session_key) = read_hello(&mut stream, keypair).await?;
    send_hello(&mut stream, keypair).await?;
    Ok((peer, link_io(stream, session_key)))
}

async fn send_hello(stream: &mut TcpStream, keypair: &Keypair) -> std::io::Result<()> {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..17].copy_from_slice(keypair.peer_id().as_bytes());
    out[17..49].copy_from_slice(keypair.public_key().as_bytes());
    stream.write_all(&out).await?;
    stream.flush().await
}

async fn read_hello(
    stream: &mut TcpStream,
    keypair: &Keypair,
) -> std::io::Result<(PeerId, [u8; 32])> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&buf[1..17]);
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&buf[17..49]);

    let claimed = PeerId::from_bytes(id_bytes);
    let public = PublicKey::from_bytes(key_bytes);
    if PeerId::from_public_key(public.as_bytes()) != claimed {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "peer id does not match public key",
        ));
    }
    let session_key = derive_session_key(&keypair.shared_secret(&public));
    Ok((claimed, session_key))
}

fn link_io(stream: TcpStream, session_key: [u8; 32]) -> LinkIo {
    let (reader, writer) = stream.into_split();
    LinkIo {
        sink: Box::new(TcpFrameSink {
            writer,
            key: session_key,
            nonce: 0,
        }),
        stream: Box::new(TcpFrameStream {
            reader,
            key: session_key,
            nonce: 0,
        }),
    }
}

struct TcpFrameSink {
    writer: OwnedWriteHalf,
    key: [u8; 32],
    nonce: u64,
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), LinkIoError> {
        let plain = encode_frame(frame).map_err(|e| LinkIoError::Fatal(e.to_string()))?;
        let cipher = encrypt_frame(&self.key, self.nonce, &plain)
            .map_err(|e| LinkIoError::Fatal(e.to_string()))?;
        self.nonce = self.nonce.wrapping_add(1);

        let len = cipher.len() as u32;
        self.writer
            .write_all(&len.to_le_bytes())
            .await
            .map_err(|e| LinkIoError::Fatal(e.to_string()))?;
        self.writer
            .write_all(&cipher)
            .await
            .map_err(|e| LinkIoError::Fatal(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| LinkIoError::Fatal(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

struct TcpFrameStream {
    reader: OwnedReadHalf,
    key: [u8; 32],
    nonce: u64,
}

#[async_trait]
impl FrameStream for TcpFrameStream {
    async fn next(&mut self) -> Result<Option<Frame>, LinkIoError> {
        let mut len_buf = [0u8; LEN_SIZE];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(LinkIoError::Fatal(e.to_string())),
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_CIPHER_LEN {
            return Err(LinkIoError::Fatal(format!("oversized frame: {len} bytes")));
        }
        let mut cipher = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut cipher)
            .await
            .map_err(|e| LinkIoError::Fatal(e.to_string()))?;

        let plain = decrypt_frame(&self.key, self.nonce, &cipher)
            .map_err(|e| LinkIoError::Fatal(e.to_string()))?;
        self.nonce = self.nonce.wrapping_add(1);
        let (frame, _) = decode_frame(&plain).map_err(|e| LinkIoError::Fatal(e.to_string()))?;
        Ok(Some(frame))
    }
}
