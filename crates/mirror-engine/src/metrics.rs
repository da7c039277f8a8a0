//! Ingest statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use mirror_decoder::DecodeCounters;
use mirror_ipc::StreamStats;

/// Collects statistics for one source.
///
/// Byte counts come from the read loop, frame counts from the frame pump,
/// and drop counts from the decode session's counters.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    bytes_received: AtomicU64,
    frame_count: AtomicU64,
    decode_errors: AtomicU64,
    last_report_time: RwLock<Instant>,
    last_frame_count: AtomicU64,
    decoder: RwLock<Option<Arc<DecodeCounters>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            bytes_received: AtomicU64::new(0),
            frame_count: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            last_report_time: RwLock::new(Instant::now()),
            last_frame_count: AtomicU64::new(0),
            decoder: RwLock::new(None),
        }
    }

    /// Start the uptime clock and zero the per-capture counters.
    pub fn start(&self) {
        self.bytes_received.store(0, Ordering::Relaxed);
        self.frame_count.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.last_frame_count.store(0, Ordering::Relaxed);
        *self.start_time.write() = Some(Instant::now());
        *self.last_report_time.write() = Instant::now();
    }

    /// Stop the uptime clock. Counters keep their final values.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn is_running(&self) -> bool {
        self.start_time.read().is_some()
    }

    /// Read drop counts from this decode session from now on.
    pub fn attach_decoder(&self, counters: Arc<DecodeCounters>) {
        *self.decoder.write() = Some(counters);
    }

    pub fn detach_decoder(&self) {
        *self.decoder.write() = None;
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current statistics. FPS covers the time since [`Self::mark_reported`].
    pub fn snapshot(&self) -> StreamStats {
        let now = Instant::now();

        let elapsed = now.duration_since(*self.last_report_time.read());
        let frames = self.frame_count.load(Ordering::Relaxed);
        let last_frames = self.last_frame_count.load(Ordering::Relaxed);
        let fps = if elapsed.as_secs_f32() > 0.0 {
            frames.saturating_sub(last_frames) as f32 / elapsed.as_secs_f32()
        } else {
            0.0
        };

        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| now.duration_since(s).as_secs())
            .unwrap_or(0);

        let frames_dropped = self
            .decoder
            .read()
            .as_ref()
            .map_or(0, |counters| counters.dropped_inactive());

        StreamStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_delivered: frames,
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            frames_dropped,
            fps,
            uptime_seconds,
        }
    }

    /// Start a new FPS window.
    pub fn mark_reported(&self) {
        *self.last_report_time.write() = Instant::now();
        self.last_frame_count
            .store(self.frame_count.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
