//! Capture orchestration for a mirrored Android device.
//!
//! A [`DeviceSource`] sequences the launcher, the video transport and the
//! decoder, maps their failures into [`CaptureError`] and publishes state
//! changes, statistics and decoded frames.
//!
//! [`CaptureError`]: mirror_ipc::CaptureError

mod error;
mod metrics;
mod monitor;
mod orchestrator;
mod pump;
mod registry;
mod state;

pub use error::{EngineError, StartupError};
pub use metrics::MetricsCollector;
pub use monitor::{resolve, Notice};
pub use orchestrator::{Collaborators, DeviceSource};
pub use pump::{CaptureFrame, FRAME_CHANNEL_CAPACITY, STATS_INTERVAL};
pub use registry::{DeviceLease, DeviceRegistry};
pub use state::{ResourceManager, StartupContext};

use crossbeam_channel::Sender;
use mirror_ipc::{SessionConfiguration, SourceEvent};

/// Create a source that publishes its events on `event_tx`.
pub fn create_source(
    config: SessionConfiguration,
    collaborators: Collaborators,
    event_tx: Sender<SourceEvent>,
) -> DeviceSource {
    DeviceSource::new(config, collaborators, event_tx)
}
