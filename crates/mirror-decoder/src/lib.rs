//! Hardware video decoding for the mirrored stream.
//!
//! The crate is split the same way the stream is: a [`DecodeQueue`] worker
//! owns the demuxer and the [`DecodeSession`], and the session drives a
//! platform [`HardwareSession`] opened through a [`DecoderBackend`]. Decoded
//! images come back as [`DecoderEvent`]s on a bounded channel.

mod error;
mod queue;
mod session;
#[cfg(target_os = "macos")]
mod videotoolbox;

pub use error::DecoderError;
pub use queue::{ChunkSender, DecodeQueue, CHUNK_CHANNEL_CAPACITY};
pub use session::{DecodeCounters, DecodeSession, DecodeState};
#[cfg(target_os = "macos")]
pub use videotoolbox::{PixelBuffer, VideoToolboxBackend};

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;

use mirror_ipc::VideoCodec;
use mirror_transport::ParameterSetCache;

/// Channel capacity for decoder output events.
pub const DECODED_CHANNEL_CAPACITY: usize = 8;

/// Length of the big-endian size prefix in front of every sample NAL unit.
pub const NAL_LENGTH_SIZE: usize = 4;

/// Result type for decoder operations.
pub type DecoderResult<T> = Result<T, DecoderError>;

/// Parameter sets needed to configure a hardware decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescription {
    codec: VideoCodec,
    parameter_sets: Vec<Bytes>,
}

impl FormatDescription {
    /// Build a description from a complete cache.
    ///
    /// Parameter sets are ordered SPS, PPS for H.264 and VPS, SPS, PPS for
    /// H.265. Returns `None` while the cache is incomplete.
    pub fn from_cache(codec: VideoCodec, cache: &ParameterSetCache) -> Option<Self> {
        if !cache.is_complete(codec) {
            return None;
        }

        let mut parameter_sets = Vec::with_capacity(3);
        if codec.requires_vps() {
            parameter_sets.push(cache.vps()?.clone());
        }
        parameter_sets.push(cache.sps()?.clone());
        parameter_sets.push(cache.pps()?.clone());

        Some(Self {
            codec,
            parameter_sets,
        })
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn parameter_sets(&self) -> &[Bytes] {
        &self.parameter_sets
    }

    /// Size of the length prefix samples are framed with.
    pub fn nal_length_size(&self) -> usize {
        NAL_LENGTH_SIZE
    }
}

/// Shared handle on a platform image (a `CVPixelBuffer` on macOS).
///
/// Clones are cheap and keep the underlying image alive.
#[derive(Clone)]
pub struct ImageBuffer(Arc<dyn Any + Send + Sync>);

impl ImageBuffer {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    /// Borrow the platform image if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether both handles refer to the same image.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("refs", &Arc::strong_count(&self.0))
            .finish()
    }
}

/// A decoded image with its presentation time.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: ImageBuffer,
    pub width: u32,
    pub height: u32,

    /// Time since the decode session started.
    pub pts: Duration,
}

/// Output of a hardware session.
#[derive(Debug, Clone)]
pub enum DecoderEvent {
    /// A frame was decoded.
    Frame(DecodedImage),

    /// A frame failed to decode and was dropped.
    Error { reason: String },
}

/// An open platform decoder bound to one format description.
///
/// Decoding is asynchronous: results arrive on the output channel the
/// session was opened with, possibly on another thread.
pub trait HardwareSession: Send {
    /// Submit one length-prefixed sample. Must not block on decode.
    fn decode(&mut self, sample: Bytes, pts: Duration) -> DecoderResult<()>;

    /// Flush pending frames and release the platform session.
    ///
    /// Called at most once.
    fn invalidate(&mut self);
}

/// Factory for hardware sessions.
pub trait DecoderBackend: Send + Sync {
    /// Open a session for `format`, delivering results to `output`.
    fn open(
        &self,
        format: &FormatDescription,
        output: Sender<DecoderEvent>,
    ) -> DecoderResult<Box<dyn HardwareSession>>;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Create the decoder backend for this platform.
#[cfg(target_os = "macos")]
pub fn platform_backend() -> DecoderResult<Arc<dyn DecoderBackend>> {
    tracing::info!("Using VideoToolbox hardware decoder");
    Ok(Arc::new(VideoToolboxBackend))
}

/// Create the decoder backend (stub for platforms without VideoToolbox).
#[cfg(not(target_os = "macos"))]
pub fn platform_backend() -> DecoderResult<Arc<dyn DecoderBackend>> {
    Err(DecoderError::NotSupported(
        "Hardware decoding is only supported on macOS".into(),
    ))
}
