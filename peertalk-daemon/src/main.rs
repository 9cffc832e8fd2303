// PeerTalk LAN daemon: discovery, TCP links, talk engine host.

mod audio;
mod config;
mod discovery;
mod identity;
mod stores;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use peertalk_core::{EngineStatus, PeerTalkEngine};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("peertalk-daemon {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let identity_path = cfg
        .identity_path
        .clone()
        .unwrap_or_else(identity::default_path);
    let keypair = Arc::new(identity::load_or_generate(&identity_path)?);
    info!(peer = %keypair.peer_id(), "peertalk-daemon {VERSION} starting");

    let addr_book = Arc::new(discovery::AddrBook::default());
    let friends = stores::ConfigFriends::new(cfg.friend_ids());
    let blob_dir = cfg
        .blob_dir
        .clone()
        .unwrap_or_else(|| default_blob_dir());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (engine, mut status_rx) = PeerTalkEngine::new(
            cfg.engine_config(),
            keypair.peer_id(),
            Arc::new(transport::TcpConnector::new(
                keypair.clone(),
                addr_book.clone(),
            )),
            vec![Arc::new(discovery::LanDiscovery::new(
                keypair.clone(),
                cfg.discovery_port,
                cfg.transport_port,
                addr_book,
            ))],
            Box::new(audio::SilenceCapture),
            Box::new(audio::DiscardPlayback),
            friends,
            Arc::new(stores::LogHistory),
            stores::FsBlobStore::new(blob_dir),
        );

        let listener_engine = engine.clone();
        let listener_keypair = keypair.clone();
        let transport_port = cfg.transport_port;
        tokio::spawn(async move {
            if let Err(e) =
                transport::run_listener(transport_port, listener_keypair, listener_engine).await
            {
                warn!("link listener stopped: {e}");
            }
        });

        tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                log_status(status);
            }
        });

        engine.start_scanning(&cfg.transport_kinds().into_iter().collect());
        shutdown_signal().await?;

        info!("shutting down");
        engine.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

fn log_status(status: EngineStatus) {
    match status {
        EngineStatus::PeerConnected { peer, kind } => info!(peer = %peer, kind = %kind, "connected"),
        EngineStatus::PeerDisconnected { peer } => info!(peer = %peer, "disconnected"),
        EngineStatus::ReachablePeers(n) => info!(reachable = n, "reachability changed"),
        EngineStatus::NoReachablePeers => info!("talking with nobody in range"),
        EngineStatus::TransportUnavailable { kind, reason } => {
            warn!(kind = %kind, "transport unavailable: {reason}")
        }
        EngineStatus::MessageDelivered { id, recipient } => {
            info!(id = %id, recipient = %recipient, "delivered")
        }
        EngineStatus::DeliveryFailed { id, recipient, reason } => {
            warn!(id = %id, recipient = %recipient, "delivery failed: {reason}")
        }
        EngineStatus::MessageReceived { id, from, .. } => {
            info!(id = %id, from = %from, "message received")
        }
    }
}

fn default_blob_dir() -> PathBuf {
    match std::env::var_os("HOME").map(PathBuf::from) {
        Some(h) => h.join(".local/share/peertalk/blobs"),
        None => PathBuf::from("/var/lib/peertalk/blobs"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
