//! adb tunnel negotiation.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::LauncherError;
use crate::LauncherResult;

/// Upper bound (exclusive) for session ids; the server parses them as a
/// signed 32-bit integer.
const SCID_LIMIT: u32 = 0x7FFF_FFFF;

/// Direction of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelMode {
    /// The device dials out to the desktop listener.
    Reverse,
    /// The desktop dials in to the device listener.
    Forward,
}

impl TunnelMode {
    pub fn is_forward(self) -> bool {
        matches!(self, Self::Forward)
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reverse => f.write_str("reverse"),
            Self::Forward => f.write_str("forward"),
        }
    }
}

/// Draw a session id.
pub fn random_scid() -> u32 {
    rand::random_range(0..SCID_LIMIT)
}

/// An established tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pub local_port: u16,
    pub socket_name: String,
    pub scid: u32,
    pub mode: TunnelMode,
    removed: bool,
}

impl TunnelHandle {
    /// Device socket name for a session id.
    pub fn socket_name_for(scid: u32) -> String {
        format!("scrcpy_{:08x}", scid)
    }

    /// Set up a reverse tunnel, falling back to forward once.
    ///
    /// Reverse tunnels are not supported on every adb transport. On failure
    /// nothing is left registered on the device.
    pub async fn negotiate(bridge: &dyn Bridge, scid: u32, local_port: u16) -> LauncherResult<Self> {
        let socket_name = Self::socket_name_for(scid);

        let mode = match bridge.reverse(&socket_name, local_port).await {
            Ok(()) => TunnelMode::Reverse,
            Err(reverse) => {
                warn!("Reverse tunnel failed, trying forward: {}", reverse);
                match bridge.forward(local_port, &socket_name).await {
                    Ok(()) => TunnelMode::Forward,
                    Err(forward) => {
                        return Err(LauncherError::TunnelFailed {
                            reverse: reverse.to_string(),
                            forward: forward.to_string(),
                        });
                    }
                }
            }
        };

        info!(%mode, %socket_name, local_port, "Tunnel established");

        Ok(Self {
            local_port,
            socket_name,
            scid,
            mode,
            removed: false,
        })
    }

    /// Remove the tunnel. Later calls do nothing.
    pub async fn remove(&mut self, bridge: &dyn Bridge) {
        if self.removed {
            return;
        }
        self.removed = true;

        let result = match self.mode {
            TunnelMode::Reverse => bridge.reverse_remove(&self.socket_name).await,
            TunnelMode::Forward => bridge.forward_remove(self.local_port).await,
        };

        match result {
            Ok(()) => debug!(mode = %self.mode, "Tunnel removed"),
            Err(e) => warn!(mode = %self.mode, "Failed to remove tunnel: {}", e),
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}
