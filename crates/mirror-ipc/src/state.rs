//! Device source state machine types.

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// The current state of a device source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    /// Freshly created, nothing started.
    #[default]
    Idle,

    /// Checking the toolchain and building the decode pipeline.
    Connecting,

    /// Decode pipeline ready; not capturing.
    Connected,

    /// Server running and frames flowing.
    Capturing,

    /// A failure ended the previous state.
    Error(CaptureError),

    /// Explicitly disconnected; all resources released.
    Disconnected,
}

impl SourceState {
    /// Returns true if the source is idle or disconnected.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected)
    }

    /// Returns true if the source is connected but not capturing.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns true if the source is capturing.
    pub fn is_capturing(&self) -> bool {
        matches!(self, Self::Capturing)
    }

    /// Returns true if the source is in an error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The error carried by this state, if any.
    pub fn error(&self) -> Option<&CaptureError> {
        match self {
            Self::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Capturing => "Capturing",
            Self::Error(_) => "Error",
            Self::Disconnected => "Disconnected",
        }
    }
}

/// Capture startup phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupPhase {
    /// Push the server payload and negotiate the tunnel.
    PrepareEnvironment,

    /// Bind the local listener when the device dials in.
    OpenTransport,

    /// Launch the on-device server.
    StartServer,

    /// Dial the forwarded port or accept the device's connection.
    ConnectTransport,

    /// Start reading the video stream.
    StartReadLoop,
}

impl StartupPhase {
    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::PrepareEnvironment => Some(Self::OpenTransport),
            Self::OpenTransport => Some(Self::StartServer),
            Self::StartServer => Some(Self::ConnectTransport),
            Self::ConnectTransport => Some(Self::StartReadLoop),
            Self::StartReadLoop => None,
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::PrepareEnvironment => "Preparing device",
            Self::OpenTransport => "Opening transport",
            Self::StartServer => "Starting server",
            Self::ConnectTransport => "Connecting video socket",
            Self::StartReadLoop => "Starting stream",
        }
    }
}

/// Capture shutdown phases, in the order they must run.
///
/// The reader is cancelled and the socket's read side shut down before the
/// socket is closed; the server is terminated before its tunnel is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownPhase {
    /// Signal the read loop to stop.
    CancelReader,

    /// Half-close the socket's read side so a pending read returns.
    ShutdownRead,

    /// Wait, bounded, for the read loop to exit.
    AwaitReader,

    /// Fully close the socket.
    CloseSocket,

    /// Terminate the on-device server.
    TerminateServer,

    /// Remove the reverse or forward tunnel.
    RemoveTunnel,

    /// Release the per-device lease.
    ReleaseDevice,
}

impl ShutdownPhase {
    /// First phase of every shutdown.
    pub const FIRST: Self = Self::CancelReader;

    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::CancelReader => Some(Self::ShutdownRead),
            Self::ShutdownRead => Some(Self::AwaitReader),
            Self::AwaitReader => Some(Self::CloseSocket),
            Self::CloseSocket => Some(Self::TerminateServer),
            Self::TerminateServer => Some(Self::RemoveTunnel),
            Self::RemoveTunnel => Some(Self::ReleaseDevice),
            Self::ReleaseDevice => None,
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::CancelReader => "Cancelling reader",
            Self::ShutdownRead => "Shutting down read side",
            Self::AwaitReader => "Waiting for reader",
            Self::CloseSocket => "Closing socket",
            Self::TerminateServer => "Stopping server",
            Self::RemoveTunnel => "Removing tunnel",
            Self::ReleaseDevice => "Releasing device",
        }
    }
}

/// Reason for tearing down a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The application asked to stop.
    UserRequested,

    /// The server exited with a normal code.
    ServerFinished { exit_code: i32 },

    /// The server exited abnormally.
    ServerCrashed { exit_code: i32 },

    /// The video stream closed.
    StreamClosed,

    /// A startup phase failed.
    StartupFailed { message: String },
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Capture stopped by user".to_string(),
            Self::ServerFinished { exit_code } => format!("Server finished (exit code {exit_code})"),
            Self::ServerCrashed { exit_code } => format!("Server crashed (exit code {exit_code})"),
            Self::StreamClosed => "Video stream closed".to_string(),
            Self::StartupFailed { message } => format!("Startup failed: {message}"),
        }
    }
}
