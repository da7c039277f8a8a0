//! Engine error types and their mapping to the public taxonomy.

use thiserror::Error;

use mirror_decoder::DecoderError;
use mirror_ipc::{CaptureError, StartupPhase};
use mirror_launcher::LauncherError;
use mirror_transport::TransportError;

/// Errors from the layers the engine drives.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Launcher(#[from] LauncherError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decoder(#[from] DecoderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout(_)))
    }
}

/// A capture startup phase failed.
#[derive(Debug, Error)]
#[error("{} failed: {}", .phase.name(), .source)]
pub struct StartupError {
    pub phase: StartupPhase,
    #[source]
    pub source: EngineError,
}

impl StartupError {
    pub fn new(phase: StartupPhase, source: impl Into<EngineError>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }

    /// Public error for this failure.
    pub fn to_capture_error(&self) -> CaptureError {
        if self.source.is_timeout() {
            CaptureError::Timeout(self.to_string())
        } else {
            CaptureError::CaptureStartFailed(self.to_string())
        }
    }
}
