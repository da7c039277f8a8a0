//! Error types for the transport module.

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Every connect attempt failed.
    #[error("Connection failed after {attempts} attempts: {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    /// Binding the local listener failed.
    #[error("Failed to listen on port {port}: {reason}")]
    ListenFailed { port: u16, reason: String },

    /// The device did not dial in before the deadline.
    #[error("Timed out after {0} ms waiting for the device to connect")]
    Timeout(u64),

    /// The socket was already handed to a read loop or closed.
    #[error("Socket not connected")]
    NotConnected,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
