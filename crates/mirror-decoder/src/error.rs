//! Error types for the decoder module.

use thiserror::Error;

/// Errors that can occur during decoding operations.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// No hardware decoder on this platform.
    #[error("Decoder not supported: {0}")]
    NotSupported(String),

    /// The parameter sets were rejected.
    #[error("Invalid format description: {0}")]
    InvalidFormat(String),

    /// The platform session could not be created.
    #[error("Decoder session creation failed: {0}")]
    SessionCreate(String),

    /// A sample could not be submitted.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// The session was already invalidated.
    #[error("Decoder session invalidated")]
    Invalidated,

    /// The decode queue worker could not be started.
    #[error("Decode queue failed: {0}")]
    Queue(String),
}
