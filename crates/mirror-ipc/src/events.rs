//! Events sent from the engine to the application.

use serde::{Deserialize, Serialize};

use crate::state::SourceState;
use crate::types::StreamStats;

/// Events that a device source publishes.
///
/// Decoded frames travel on their own channel because image buffers are
/// platform handles, not serializable values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SourceEvent {
    /// Source state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<SourceState>,

        /// Current state.
        current: Box<SourceState>,
    },

    /// Periodic ingest statistics.
    Stats(StreamStats),
}
