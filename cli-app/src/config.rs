//! Configuration file for the mirror binary.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use mirror_ipc::SessionConfiguration;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub session: SessionConfiguration,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

/// Desktop-side executables and payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// The `adb` executable, resolved through `PATH` if not absolute.
    pub adb: PathBuf,
    /// Local copy of the server payload pushed to the device.
    pub server_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            adb: PathBuf::from("adb"),
            server_path: PathBuf::from("scrcpy-server"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl MirrorConfig {
    /// Load a configuration file. A missing file yields the defaults; a
    /// malformed one is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
