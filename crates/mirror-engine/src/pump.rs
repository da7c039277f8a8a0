//! Delivery of decoded images to the renderer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use mirror_decoder::{DecodedImage, DecoderEvent, ImageBuffer};
use mirror_ipc::{SourceEvent, SourceState};

use crate::metrics::MetricsCollector;

/// Decoded frames buffered for the renderer. While the buffer is full new
/// frames are not queued; `latest_frame` always has the newest one.
pub const FRAME_CHANNEL_CAPACITY: usize = 4;

/// How often statistics are published while capturing.
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A decoded frame ready for rendering.
///
/// Holds a strong reference to the image; dropping the frame releases it.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub image: ImageBuffer,

    /// Time since the decode session started.
    pub presentation_time: Duration,

    pub width: u32,
    pub height: u32,

    /// Position in delivery order, starting at 0 for each pump.
    pub sequence: u64,
}

impl CaptureFrame {
    fn from_decoded(decoded: DecodedImage, sequence: u64) -> Self {
        Self {
            image: decoded.image,
            presentation_time: decoded.pts,
            width: decoded.width,
            height: decoded.height,
            sequence,
        }
    }
}

/// Slot holding the most recent frame.
pub type LatestFrame = Arc<Mutex<Option<CaptureFrame>>>;

/// Everything the pump thread publishes to.
pub struct PumpOutputs {
    pub frames: Sender<CaptureFrame>,
    pub latest: LatestFrame,
    pub events: Sender<SourceEvent>,
    pub state: Arc<RwLock<SourceState>>,
    pub metrics: Arc<MetricsCollector>,
}

/// Thread consuming decoder output.
pub struct FramePump {
    should_stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FramePump {
    pub fn spawn(decoded: Receiver<DecoderEvent>, outputs: PumpOutputs) -> std::io::Result<Self> {
        let should_stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&should_stop);

        let thread = thread::Builder::new()
            .name("frame-pump".into())
            .spawn(move || pump_loop(decoded, outputs, stop))?;

        Ok(Self {
            should_stop,
            thread: Some(thread),
        })
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Frame pump thread panicked");
            }
        }
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop(decoded: Receiver<DecoderEvent>, outputs: PumpOutputs, should_stop: Arc<AtomicBool>) {
    debug!("Frame pump starting");

    let mut sequence: u64 = 0;
    let mut last_stats = Instant::now();

    while !should_stop.load(Ordering::SeqCst) {
        match decoded.recv_timeout(POLL_INTERVAL) {
            Ok(DecoderEvent::Frame(image)) => {
                let frame = CaptureFrame::from_decoded(image, sequence);
                sequence += 1;

                if sequence == 1 {
                    info!(width = frame.width, height = frame.height, "First frame decoded");
                }

                *outputs.latest.lock() = Some(frame.clone());
                outputs.metrics.record_frame();

                match outputs.frames.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => trace!("Renderer behind, frame not queued"),
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
            Ok(DecoderEvent::Error { reason }) => {
                outputs.metrics.record_decode_error();
                debug!(%reason, "Frame dropped by decoder");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Decoder output closed");
                break;
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            if outputs.state.read().is_capturing() {
                let stats = outputs.metrics.snapshot();
                outputs.metrics.mark_reported();
                if let Err(e) = outputs.events.try_send(SourceEvent::Stats(stats)) {
                    trace!("Failed to send stats: {}", e);
                }
            }
        }
    }

    debug!(delivered = sequence, "Frame pump stopped");
}
