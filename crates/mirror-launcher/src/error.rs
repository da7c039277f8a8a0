//! Error types for the launcher module.

use thiserror::Error;

/// Errors that can occur while preparing the device or running the server.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// The local server payload does not exist.
    #[error("Server payload not found: {0}")]
    PayloadMissing(String),

    /// Pushing the payload to the device failed.
    #[error("Failed to push server to device: {0}")]
    PushFailed(String),

    /// Neither tunnel direction could be set up.
    #[error("Tunnel setup failed (reverse: {reverse}; forward: {forward})")]
    TunnelFailed { reverse: String, forward: String },

    /// The server process could not be spawned.
    #[error("Failed to launch server: {0}")]
    ServerLaunch(String),

    /// The server exited before the settle delay elapsed.
    #[error("Server exited during startup with code {0}")]
    ServerExited(i32),

    /// `start_server` was called before `prepare_environment`.
    #[error("Device environment not prepared")]
    NotPrepared,

    /// An adb command failed.
    #[error("adb {command} failed: {reason}")]
    Bridge { command: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
