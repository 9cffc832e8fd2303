//! Placeholder audio devices for the daemon host.
//!
//! The engine treats capture and playback as opaque codec-backed devices;
//! on a headless daemon there is no microphone or speaker to wire up, so
//! these keep the timing honest (20 ms frame cadence) while carrying
//! silence. A mobile shell substitutes its platform devices here.

use std::time::Duration;

use async_trait::async_trait;
use peertalk_core::audio::{AudioDeviceError, CaptureDevice, PlaybackDevice};
use tracing::trace;

/// Encoded-frame cadence while a hold is active.
const FRAME_INTERVAL: Duration = Duration::from_millis(20);
/// Opaque payload size per frame (sized like 20 ms of narrowband voice).
const FRAME_BYTES: usize = 160;

/// Produces silent frames at the capture cadence.
pub struct SilenceCapture;

#[async_trait]
impl CaptureDevice for SilenceCapture {
    async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, AudioDeviceError> {
        tokio::time::sleep(FRAME_INTERVAL).await;
        Ok(Some(vec![0u8; FRAME_BYTES]))
    }
}

/// Swallows inbound frames; the trace log is the only evidence.
pub struct DiscardPlayback;

impl PlaybackDevice for DiscardPlayback {
    fn render(&self, payload: &[u8]) -> Result<(), AudioDeviceError> {
        trace!(bytes = payload.len(), "inbound audio frame discarded");
        Ok(())
    }
}
