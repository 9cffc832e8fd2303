//! Audio pipeline: capture frames during a talk hold, render inbound frames.
//!
//! Codecs are out of scope: capture and playback devices exchange opaque
//! encoded payloads. The pipeline owns sequencing, hold sealing, and the
//! drop-late policy on the render path (live voice prefers loss to latency).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::identity::PeerId;

/// Frames buffered between the capture device and the fan-out before the
/// producer is back-pressured.
const CAPTURE_BUFFER: usize = 32;

/// Unique identifier for one press-to-talk interaction (UUID bytes).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TalkHoldId([u8; 16]);

impl TalkHoldId {
    pub fn new() -> Self {
        TalkHoldId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for TalkHoldId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TalkHoldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One captured audio frame. Immutable once produced; sequence is strictly
/// increasing within its hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFrame {
    pub hold: TalkHoldId,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// Microphone capture behind an opaque encoder.
#[async_trait]
pub trait CaptureDevice: Send {
    /// Next encoded payload, or `None` when the device stops on its own.
    /// Must be cancel-safe: an abandoned call loses at most one payload.
    async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, AudioDeviceError>;
}

/// Speaker output behind an opaque decoder. `render` must not block; an
/// overloaded device drops rather than stalls the caller.
pub trait PlaybackDevice: Send + Sync {
    fn render(&self, payload: &[u8]) -> Result<(), AudioDeviceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AudioDeviceError {
    #[error("audio device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("a capture is already active")]
    Active,
    #[error(transparent)]
    Device(#[from] AudioDeviceError),
}

struct CaptureRun {
    stop: watch::Sender<bool>,
    task: JoinHandle<Box<dyn CaptureDevice>>,
}

/// Owns the capture and playback devices. Exactly one capture may run at a
/// time; the engine's single-active-hold invariant leans on this.
pub struct AudioPipeline {
    device: Mutex<Option<Box<dyn CaptureDevice>>>,
    run: Mutex<Option<CaptureRun>>,
    playback: Box<dyn PlaybackDevice>,
    muted: AtomicBool,
    /// Highest sequence rendered per peer, keyed to that peer's current hold.
    cursors: StdMutex<HashMap<PeerId, (TalkHoldId, u64)>>,
}

impl AudioPipeline {
    pub fn new(capture: Box<dyn CaptureDevice>, playback: Box<dyn PlaybackDevice>) -> Self {
        Self {
            device: Mutex::new(Some(capture)),
            run: Mutex::new(None),
            playback,
            muted: AtomicBool::new(false),
            cursors: StdMutex::new(HashMap::new()),
        }
    }

    /// Start capturing for `hold`. Returns the frame stream: finite, sealed by
    /// `end_capture`, sequence starting at 1.
    pub async fn begin_capture(
        &self,
        hold: TalkHoldId,
    ) -> Result<mpsc::Receiver<AudioFrame>, CaptureError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(CaptureError::Active);
        }
        let mut device = self
            .device
            .lock()
            .await
            .take()
            .ok_or_else(|| AudioDeviceError::Unavailable("capture device missing".into()))?;

        let (tx, rx) = mpsc::channel(CAPTURE_BUFFER);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut sequence: u64 = 0;
            loop {
                let payload = tokio::select! {
                    _ = stop_rx.changed() => break,
                    p = device.next_payload() => p,
                };
                let payload = match payload {
                    Ok(Some(p)) => p,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(hold = %hold, "capture device stopped: {e}");
                        break;
                    }
                };
                sequence += 1;
                let frame = AudioFrame {
                    hold,
                    sequence,
                    captured_at: Utc::now(),
                    payload,
                };
                // Full buffer back-pressures the device rather than growing
                // without bound; a stop mid-wait discards this frame.
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    sent = tx.send(frame) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            device
        });
        *run = Some(CaptureRun { stop: stop_tx, task });
        Ok(rx)
    }

    /// Seal the current capture. When this returns, the stream emits no
    /// further frames; frames already produced finish delivery. Idempotent.
    pub async fn end_capture(&self) {
        let run = self.run.lock().await.take();
        let Some(run) = run else { return };
        let _ = run.stop.send(true);
        match run.task.await {
            Ok(device) => *self.device.lock().await = Some(device),
            Err(e) => warn!("capture task panicked: {e}"),
        }
    }

    /// Drop inbound frames instead of rendering them.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Render a frame from `from` to the local output. Fire-and-forget:
    /// late or duplicate frames for the peer's current hold are dropped, and
    /// device errors are reported but never propagate.
    pub fn render_inbound(&self, from: PeerId, frame: &AudioFrame) {
        if self.is_muted() {
            return;
        }
        {
            let mut cursors = self.cursors.lock().expect("cursor lock poisoned");
            match cursors.get_mut(&from) {
                Some((hold, highest)) if *hold == frame.hold => {
                    if frame.sequence <= *highest {
                        debug!(peer = %from, seq = frame.sequence, "dropping late audio frame");
                        return;
                    }
                    *highest = frame.sequence;
                }
                _ => {
                    // New hold from this peer resets the cursor.
                    cursors.insert(from, (frame.hold, frame.sequence));
                }
            }
        }
        if let Err(e) = self.playback.render(&frame.payload) {
            warn!(peer = %from, "audio render skipped: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    /// Scripted capture device: yields the given payloads with a short pacing
    /// delay, then pends forever (a held mic does not end on its own).
    pub struct ScriptedCapture {
        payloads: VecDeque<Vec<u8>>,
        pacing: Duration,
    }

    impl ScriptedCapture {
        pub fn new(payloads: Vec<Vec<u8>>) -> Self {
            Self {
                payloads: payloads.into(),
                pacing: Duration::from_millis(1),
            }
        }
    }

    #[async_trait]
    impl CaptureDevice for ScriptedCapture {
        async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, AudioDeviceError> {
            tokio::time::sleep(self.pacing).await;
            match self.payloads.pop_front() {
                Some(p) => Ok(Some(p)),
                None => {
                    // Pend until the hold is released.
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    /// Playback that records every rendered payload.
    #[derive(Clone, Default)]
    pub struct RecordingPlayback {
        pub rendered: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl PlaybackDevice for RecordingPlayback {
        fn render(&self, payload: &[u8]) -> Result<(), AudioDeviceError> {
            self.rendered
                .lock()
                .expect("render lock poisoned")
                .push(payload.to_vec());
            Ok(())
        }
    }
}
