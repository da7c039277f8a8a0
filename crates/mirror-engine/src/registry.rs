//! Per-device ownership.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Tracks which device serials have a capture running.
///
/// Share one registry between all sources of a process so two sources can
/// never drive the same device.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `serial`. Returns `None` if it is already held.
    pub fn acquire(&self, serial: &str) -> Option<DeviceLease> {
        if !self.held.lock().insert(serial.to_string()) {
            return None;
        }
        debug!(serial, "Device lease acquired");
        Some(DeviceLease {
            serial: serial.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, serial: &str) -> bool {
        self.held.lock().contains(serial)
    }
}

/// Exclusive claim on one device. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    serial: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl DeviceLease {
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.held.lock().remove(&self.serial);
        debug!(serial = %self.serial, "Device lease released");
    }
}
