//! Public error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to the outer application.
///
/// Lower layers translate their own errors into one of these before they
/// cross into the source state; the reason strings carry the original
/// failure text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CaptureError {
    /// The source could not reach the Connected state.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A capture startup phase failed.
    #[error("Capture start failed: {0}")]
    CaptureStartFailed(String),

    /// Another session already owns this device.
    #[error("Device {0} is already in use")]
    DeviceInUse(String),

    /// The on-device server exited abnormally while capturing.
    #[error("Server process terminated with exit code {0}")]
    ProcessTerminated(i32),

    /// The video stream closed while capturing.
    #[error("Capture interrupted: video stream closed")]
    CaptureInterrupted,

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl CaptureError {
    /// Human-readable reason, without the variant prefix.
    pub fn reason(&self) -> String {
        match self {
            Self::ConnectionFailed(reason)
            | Self::CaptureStartFailed(reason)
            | Self::Timeout(reason) => reason.clone(),
            Self::DeviceInUse(serial) => format!("device {serial} is busy"),
            Self::ProcessTerminated(code) => format!("exit code {code}"),
            Self::CaptureInterrupted => "video stream closed".to_string(),
        }
    }
}
