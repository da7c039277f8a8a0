//! Shared types for the Android mirroring pipeline.
//!
//! This crate defines the configuration value object, the source state
//! machine, the public error taxonomy and the events that the capture
//! engine publishes to the renderer and the outer application.

mod error;
mod events;
mod state;
mod types;

pub use error::CaptureError;
pub use events::SourceEvent;
pub use state::{ShutdownPhase, SourceState, StartupPhase, StopReason};
pub use types::{SessionConfiguration, StreamStats, TimingConfig, VideoCodec};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (engine → application).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<SourceEvent>, Receiver<SourceEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
