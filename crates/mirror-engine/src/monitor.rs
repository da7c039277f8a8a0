//! Notices from a running capture and what they mean for the source.

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mirror_ipc::{CaptureError, SourceState, StopReason};
use mirror_launcher::{is_normal_exit, ExitWatch};
use mirror_transport::ReadOutcome;

/// Something that ended, or may end, the capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The read loop finished.
    StreamEnded(ReadOutcome),

    /// The on-device server exited.
    ServerExited(i32),
}

/// Decide how a notice ends the capture.
///
/// `exit_code` is the server's exit code if it is known by the time the
/// notice is handled; a stream that closed because the server exited is
/// judged by that exit code. Returns `None` for notices that do not end
/// the capture.
pub fn resolve(notice: &Notice, exit_code: Option<i32>) -> Option<(StopReason, SourceState)> {
    let code = match notice {
        Notice::StreamEnded(ReadOutcome::Cancelled) => return None,
        Notice::ServerExited(code) => *code,
        Notice::StreamEnded(_) => match exit_code {
            Some(code) => code,
            None => {
                return Some((
                    StopReason::StreamClosed,
                    SourceState::Error(CaptureError::CaptureInterrupted),
                ))
            }
        },
    };

    if is_normal_exit(code) {
        Some((StopReason::ServerFinished { exit_code: code }, SourceState::Connected))
    } else {
        Some((
            StopReason::ServerCrashed { exit_code: code },
            SourceState::Error(CaptureError::ProcessTerminated(code)),
        ))
    }
}

/// Forward the server's exit code as a notice until `token` is cancelled.
pub fn spawn_exit_forwarder(
    mut exit: ExitWatch,
    token: CancellationToken,
    notices: UnboundedSender<Notice>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            code = exit.wait() => {
                if let Some(code) = code {
                    debug!(exit_code = code, "Server exit observed");
                    let _ = notices.send(Notice::ServerExited(code));
                }
            }
        }
    });
}
