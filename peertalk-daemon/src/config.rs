//! Load daemon config from file and environment.
//!
//! File: `~/.config/peertalk/config.toml` or `/etc/peertalk/config.toml`.
//! Env overrides: `PEERTALK_DISCOVERY_PORT`, `PEERTALK_TRANSPORT_PORT`.

use std::path::PathBuf;
use std::time::Duration;

use peertalk_core::{EngineConfig, PeerId, TransportKind};
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration with engine tuning. Friends are hex peer IDs
/// (32 hex chars), normally synced from the backend by the app shell.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 46510).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link transport TCP port (default 46511).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Transports to scan: "wifi-direct" and/or "bluetooth".
    #[serde(default = "default_transports")]
    pub transports: Vec<String>,
    /// Hex-encoded peer IDs of friends.
    #[serde(default)]
    pub friends: Vec<String>,
    /// Connect to sighted friends automatically.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// Liveness: seconds of silence before probing a peer.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Transmission failures per message before giving up.
    #[serde(default = "default_retry_ceiling")]
    pub delivery_retry_ceiling: u32,
    /// Where the device secret key lives; default under the config dir.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    /// Where voice-message blobs are written.
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,
}

fn default_discovery_port() -> u16 {
    46510
}
fn default_transport_port() -> u16 {
    46511
}
fn default_transports() -> Vec<String> {
    vec!["wifi-direct".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_heartbeat_secs() -> u64 {
    15
}
fn default_retry_ceiling() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            transports: default_transports(),
            friends: Vec::new(),
            auto_connect: default_true(),
            heartbeat_secs: default_heartbeat_secs(),
            delivery_retry_ceiling: default_retry_ceiling(),
            identity_path: None,
            blob_dir: None,
        }
    }
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            auto_connect: self.auto_connect,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            delivery_retry_ceiling: self.delivery_retry_ceiling,
            ..EngineConfig::default()
        }
    }

    /// Parse the friends list; malformed entries are skipped with a warning.
    pub fn friend_ids(&self) -> Vec<PeerId> {
        self.friends
            .iter()
            .filter_map(|s| match parse_peer_id(s) {
                Some(id) => Some(id),
                None => {
                    warn!("ignoring malformed friend id in config: {s}");
                    None
                }
            })
            .collect()
    }

    /// Transports to scan; unknown names are skipped with a warning.
    pub fn transport_kinds(&self) -> Vec<TransportKind> {
        self.transports
            .iter()
            .filter_map(|s| match s.as_str() {
                "wifi-direct" => Some(TransportKind::WifiDirect),
                "bluetooth" => Some(TransportKind::Bluetooth),
                other => {
                    warn!("ignoring unknown transport in config: {other}");
                    None
                }
            })
            .collect()
    }
}

fn parse_peer_id(s: &str) -> Option<PeerId> {
    let s = s.trim();
    if s.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        bytes[i] = ((hi << 4) | lo) as u8;
    }
    Some(PeerId::from_bytes(bytes))
}

/// Merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("PEERTALK_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("PEERTALK_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peertalk/config.toml"));
    }
    out.push(PathBuf::from("/etc/peertalk/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!("config file {} unreadable: {e}", p.display()),
                }
            }
            break;
        }
    }
    None
}
