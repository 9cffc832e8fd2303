//! Reconnect backoff: exponential growth with a cap and ±20 % jitter.

use std::time::Duration;

use rand::Rng;

/// Jitter applied around each delay, as a fraction of the delay.
pub const JITTER_FRACTION: f64 = 0.2;

/// Delay before connect attempt `attempt` (0-based): `base * 2^attempt`,
/// capped. Saturates instead of overflowing for absurd attempt counts.
pub fn connect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay = base
        .as_millis()
        .saturating_mul(factor as u128)
        .min(cap.as_millis());
    Duration::from_millis(delay as u64)
}

/// Spread a delay by ±`JITTER_FRACTION` so peers retrying after a shared
/// outage do not reconnect in lockstep.
pub fn with_jitter(delay: Duration, rng: &mut impl Rng) -> Duration {
    let millis = delay.as_millis() as f64;
    let spread = millis * JITTER_FRACTION;
    let jittered = millis + rng.gen_range(-spread..=spread);
    Duration::from_millis(jittered.max(0.0) as u64)
}
