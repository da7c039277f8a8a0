//! Decode session state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use mirror_ipc::VideoCodec;
use mirror_transport::{to_length_prefixed, NalUnit, ParameterSetCache};

use crate::{DecoderBackend, DecoderEvent, FormatDescription, HardwareSession};

/// Lifecycle of a decode session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeState {
    /// No parameter set seen yet.
    #[default]
    Uninitialized,
    /// Waiting for a complete parameter-set cache, or the last open failed.
    Initializing,
    /// Hardware session open; frames are decoded.
    Active,
    /// Torn down; all submissions are ignored.
    Invalidated,
}

impl DecodeState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Counters updated by the decode queue.
#[derive(Debug, Default)]
pub struct DecodeCounters {
    submitted: AtomicU64,
    dropped_inactive: AtomicU64,
    submit_errors: AtomicU64,
    initializations: AtomicU64,
}

impl DecodeCounters {
    /// Frames handed to the hardware session.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Frames dropped because the session was not active.
    pub fn dropped_inactive(&self) -> u64 {
        self.dropped_inactive.load(Ordering::Relaxed)
    }

    /// Frames the hardware session refused.
    pub fn submit_errors(&self) -> u64 {
        self.submit_errors.load(Ordering::Relaxed)
    }

    /// Hardware sessions opened, including re-opens on format change.
    pub fn initializations(&self) -> u64 {
        self.initializations.load(Ordering::Relaxed)
    }
}

/// Routes NAL units to a lazily opened hardware session.
///
/// Parameter sets (re)initialize the session; frame units are decoded only
/// while the session is [`DecodeState::Active`].
pub struct DecodeSession {
    codec: VideoCodec,
    backend: Arc<dyn DecoderBackend>,
    output: Sender<DecoderEvent>,
    hardware: Option<Box<dyn HardwareSession>>,
    format: Option<FormatDescription>,
    state: Arc<RwLock<DecodeState>>,
    counters: Arc<DecodeCounters>,
    clock: Instant,
}

impl DecodeSession {
    /// Create a session. No hardware is touched until parameter sets arrive.
    pub fn new(
        codec: VideoCodec,
        backend: Arc<dyn DecoderBackend>,
        output: Sender<DecoderEvent>,
    ) -> Self {
        Self {
            codec,
            backend,
            output,
            hardware: None,
            format: None,
            state: Arc::new(RwLock::new(DecodeState::Uninitialized)),
            counters: Arc::new(DecodeCounters::default()),
            clock: Instant::now(),
        }
    }

    /// Current state.
    pub fn state(&self) -> DecodeState {
        *self.state.read()
    }

    /// Shared view of the state for observers on other threads.
    pub fn state_handle(&self) -> Arc<RwLock<DecodeState>> {
        Arc::clone(&self.state)
    }

    pub fn counters(&self) -> Arc<DecodeCounters> {
        Arc::clone(&self.counters)
    }

    /// Route one unit. `cache` must reflect the stream up to this unit.
    pub fn submit(&mut self, unit: &NalUnit, cache: &ParameterSetCache) {
        if self.state() == DecodeState::Invalidated {
            return;
        }

        if unit.is_parameter_set() {
            self.try_initialize(cache);
        } else {
            self.decode(unit);
        }
    }

    /// Open the hardware session if the cache is complete.
    ///
    /// Returns true if the session is active afterwards. A changed set of
    /// parameter sets closes the current session and opens a new one.
    pub fn try_initialize(&mut self, cache: &ParameterSetCache) -> bool {
        match self.state() {
            DecodeState::Invalidated => return false,
            DecodeState::Uninitialized => self.set_state(DecodeState::Initializing),
            _ => {}
        }

        let Some(format) = FormatDescription::from_cache(self.codec, cache) else {
            trace!("Parameter sets incomplete");
            return false;
        };

        if self.state().is_active() && self.format.as_ref() == Some(&format) {
            return true;
        }

        if let Some(mut hardware) = self.hardware.take() {
            info!("Parameter sets changed, reopening decoder");
            hardware.invalidate();
            self.format = None;
            self.set_state(DecodeState::Initializing);
        }

        match self.backend.open(&format, self.output.clone()) {
            Ok(hardware) => {
                self.hardware = Some(hardware);
                self.format = Some(format);
                self.counters.initializations.fetch_add(1, Ordering::Relaxed);
                self.set_state(DecodeState::Active);
                info!(
                    codec = %self.codec,
                    backend = self.backend.name(),
                    "Decoder session active"
                );
                true
            }
            Err(e) => {
                warn!("Failed to open decoder, waiting for next parameter set: {}", e);
                false
            }
        }
    }

    /// Submit a frame unit. Dropped unless active.
    pub fn decode(&mut self, unit: &NalUnit) {
        let hardware = match (self.state(), self.hardware.as_mut()) {
            (DecodeState::Active, Some(hardware)) => hardware,
            (state, _) => {
                self.counters.dropped_inactive.fetch_add(1, Ordering::Relaxed);
                trace!(?state, "Dropping frame, decoder not active");
                return;
            }
        };

        let sample = to_length_prefixed(&unit.payload);
        let pts = self.clock.elapsed();

        match hardware.decode(sample, pts) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.submit_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Frame submission failed: {}", e);
                let _ = self.output.try_send(DecoderEvent::Error {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Release the hardware session. Safe to call repeatedly or before any
    /// session was opened.
    pub fn invalidate(&mut self) {
        if self.state() == DecodeState::Invalidated {
            return;
        }
        if let Some(mut hardware) = self.hardware.take() {
            hardware.invalidate();
            debug!("Decoder session invalidated");
        }
        self.format = None;
        self.set_state(DecodeState::Invalidated);
    }

    fn set_state(&self, state: DecodeState) {
        *self.state.write() = state;
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.invalidate();
    }
}
