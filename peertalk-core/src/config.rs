//! Engine tuning knobs. Hosts build this from their own config surface
//! (file + env in the daemon); defaults match the protocol's documented
//! behavior, so `EngineConfig::default()` is a working configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Connect to sighted friends automatically.
    pub auto_connect: bool,
    /// First reconnect delay; doubles per attempt.
    pub connect_backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub connect_backoff_cap: Duration,
    /// Connect attempts before the peer reverts to awaiting a fresh sighting.
    pub connect_attempt_ceiling: u32,
    /// No inbound activity for this long triggers a liveness probe.
    pub heartbeat_interval: Duration,
    /// Probe unanswered for this long declares the peer lost.
    pub probe_timeout: Duration,
    /// How often the liveness sweeper runs (and heartbeats go out).
    pub liveness_sweep_interval: Duration,
    /// Outbound frames buffered per link before sends report backpressure.
    pub link_send_buffer: usize,
    /// Transient write errors tolerated before a degraded link closes.
    pub link_write_retries: u32,
    /// Transmission failures per message before it fails terminally.
    pub delivery_retry_ceiling: u32,
    /// How long a drain waits for a delivery receipt.
    pub delivery_ack_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            connect_backoff_base: Duration::from_secs(1),
            connect_backoff_cap: Duration::from_secs(30),
            connect_attempt_ceiling: 5,
            heartbeat_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(3),
            liveness_sweep_interval: Duration::from_secs(5),
            link_send_buffer: 32,
            link_write_retries: 3,
            delivery_retry_ceiling: 5,
            delivery_ack_timeout: Duration::from_secs(10),
        }
    }
}
