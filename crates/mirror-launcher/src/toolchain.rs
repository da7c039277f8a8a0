//! Location of the local server payload.

use std::path::{Path, PathBuf};

/// Resolves the desktop-side tools a session needs.
pub trait Toolchain: Send + Sync {
    /// Path of the server payload, if one is configured.
    fn server_path(&self) -> Option<PathBuf>;

    /// Whether the payload exists locally.
    fn server_available(&self) -> bool {
        self.server_path().is_some_and(|path| path.is_file())
    }
}

/// Toolchain with a fixed payload path.
#[derive(Debug, Clone)]
pub struct LocalToolchain {
    server_path: PathBuf,
}

impl LocalToolchain {
    pub fn new(server_path: impl Into<PathBuf>) -> Self {
        Self {
            server_path: server_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.server_path
    }
}

impl Toolchain for LocalToolchain {
    fn server_path(&self) -> Option<PathBuf> {
        Some(self.server_path.clone())
    }
}
