//! Video socket transport and Annex-B demuxing.
//!
//! This crate owns the TCP socket carrying the server's raw video stream
//! and the stateful parser that splits that stream into NAL units.

mod connection;
mod error;
mod nal;
mod socket;

pub use connection::{ConnectionState, RetryPolicy};
pub use error::TransportError;
pub use nal::{
    to_length_prefixed, Demuxer, NalKind, NalUnit, ParameterSetCache, MAX_PENDING_BYTES,
};
pub use socket::{
    connect_with_retry, Dialer, ReadLoopHandle, ReadOutcome, TcpDialer, VideoListener, VideoSocket,
};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Retries after the first failed connect attempt.
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Fixed delay between connect attempts in milliseconds.
pub const CONNECT_RETRY_DELAY_MS: u64 = 100;

/// Size of the socket read buffer.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;
