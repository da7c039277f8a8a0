//! Common types used across the pipeline.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Video codec requested from the on-device server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264 / AVC.
    #[default]
    H264,

    /// H.265 / HEVC.
    H265,
}

impl VideoCodec {
    /// Name understood by the server's `video_codec=` argument.
    pub fn server_name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
        }
    }

    /// Whether the codec needs a video parameter set before decoding.
    pub fn requires_vps(self) -> bool {
        matches!(self, Self::H265)
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.server_name())
    }
}

/// Configuration for one mirroring session of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfiguration {
    /// Device serial as reported by the bridge.
    pub serial: String,

    /// Maximum pixel dimension of the mirrored stream (0 = unlimited).
    pub max_size: u32,

    /// Encoder bit rate in bits per second (0 = server default).
    pub bit_rate: u32,

    /// Maximum frame rate (0 = unlimited).
    pub max_fps: u32,

    /// Codec requested from the server.
    pub codec: VideoCodec,

    /// Local TCP port used for the tunnel.
    pub local_port: u16,

    /// Protocol version string passed as the server's first argument.
    pub protocol_version: String,

    /// Keep the device awake while mirroring.
    pub stay_awake: bool,

    /// Connection and shutdown timing.
    pub timing: TimingConfig,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            serial: String::new(),
            max_size: 0,
            bit_rate: 8_000_000,
            max_fps: 60,
            codec: VideoCodec::H264,
            local_port: 27183,
            protocol_version: "3.3.4".to_string(),
            stay_awake: false,
            timing: TimingConfig::default(),
        }
    }
}

/// Timing knobs for connection establishment and teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Retries after the first failed connect attempt.
    pub connect_retries: u32,

    /// Fixed delay between connect attempts in milliseconds.
    pub connect_retry_delay_ms: u64,

    /// Delay after launching the server before checking it is alive.
    pub server_settle_ms: u64,

    /// How long to wait for the device to dial in on a reverse tunnel.
    pub accept_timeout_ms: u64,

    /// Grace period for the read loop to observe cancellation.
    pub shutdown_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_retries: 5,
            connect_retry_delay_ms: 100,
            server_settle_ms: 300,
            accept_timeout_ms: 5_000,
            shutdown_grace_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn server_settle(&self) -> Duration {
        Duration::from_millis(self.server_settle_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Snapshot of ingest statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    /// Bytes read from the video socket.
    pub bytes_received: u64,

    /// Frames handed to the renderer.
    pub frames_delivered: u64,

    /// Frames the decoder rejected.
    pub decode_errors: u64,

    /// Frame units dropped because no decode session was active.
    pub frames_dropped: u64,

    /// Delivered frames per second since the previous snapshot.
    pub fps: f32,

    /// Seconds since capture started.
    pub uptime_seconds: u64,
}
