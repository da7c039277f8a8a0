//! Connection state and retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{CONNECT_RETRY_DELAY_MS, MAX_CONNECT_RETRIES};

/// Connection state of the video socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,

    /// Attempting to connect.
    Connecting { attempt: u32 },

    /// Connected, stream not yet read.
    Connected,

    /// Read loop running.
    Streaming,
}

impl ConnectionState {
    /// Check if connected or streaming.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Streaming)
    }

    /// Get status message for logs.
    pub fn message(&self) -> String {
        match self {
            Self::Disconnected => "Disconnected".to_string(),
            Self::Connecting { attempt } => {
                format!("Connecting ({}/{})", attempt, MAX_CONNECT_RETRIES + 1)
            }
            Self::Connected => "Connected".to_string(),
            Self::Streaming => "Streaming".to_string(),
        }
    }
}

/// Connect retry policy.
///
/// The server needs a short warm-up after launch before its listener is
/// ready, so connects are retried with a fixed delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_CONNECT_RETRIES,
            delay: Duration::from_millis(CONNECT_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry count and delay.
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}
