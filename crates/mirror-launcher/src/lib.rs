//! Device-side environment for a mirroring session.
//!
//! Pushes the server payload, negotiates the adb tunnel the video socket
//! runs through, and launches and supervises the on-device server. All
//! device access goes through the [`Bridge`] trait.

mod bridge;
mod error;
mod launcher;
mod server;
mod toolchain;
mod tunnel;

pub use bridge::{AdbBridge, Bridge, RemoteProcess};
pub use error::LauncherError;
pub use launcher::Launcher;
pub use server::{
    is_normal_exit, ExitWatch, ServerArgs, ServerProcess, SERVER_MAIN_CLASS, SERVER_REMOTE_PATH,
};
pub use toolchain::{LocalToolchain, Toolchain};
pub use tunnel::{random_scid, TunnelHandle, TunnelMode};

/// Result type for launcher operations.
pub type LauncherResult<T> = Result<T, LauncherError>;

#[cfg(test)]
pub(crate) mod testing;
