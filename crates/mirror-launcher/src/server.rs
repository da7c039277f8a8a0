//! On-device server arguments and process supervision.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mirror_ipc::{SessionConfiguration, VideoCodec};

use crate::bridge::RemoteProcess;
use crate::tunnel::TunnelMode;

/// Where the server payload is pushed on the device.
pub const SERVER_REMOTE_PATH: &str = "/data/local/tmp/scrcpy-server.jar";

/// Entry point class inside the payload.
pub const SERVER_MAIN_CLASS: &str = "com.genymobile.scrcpy.Server";

/// Whether an exit code counts as a clean shutdown.
///
/// 15 is SIGTERM reported directly, 143 is SIGTERM as reported by a shell.
pub fn is_normal_exit(code: i32) -> bool {
    matches!(code, 0 | 15 | 143)
}

/// Arguments for one server launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerArgs {
    pub version: String,
    pub scid: u32,
    pub tunnel_mode: TunnelMode,
    pub max_size: u32,
    pub max_fps: u32,
    pub video_bit_rate: u32,
    pub codec: VideoCodec,
    pub stay_awake: bool,
}

impl ServerArgs {
    pub fn new(config: &SessionConfiguration, scid: u32, tunnel_mode: TunnelMode) -> Self {
        Self {
            version: config.protocol_version.clone(),
            scid,
            tunnel_mode,
            max_size: config.max_size,
            max_fps: config.max_fps,
            video_bit_rate: config.bit_rate,
            codec: config.codec,
            stay_awake: config.stay_awake,
        }
    }

    /// Server arguments: the version followed by `key=value` options.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            self.version.clone(),
            format!("scid={:08x}", self.scid),
            "log_level=info".to_string(),
            "audio=false".to_string(),
            "control=false".to_string(),
        ];

        if self.tunnel_mode.is_forward() {
            args.push("tunnel_forward=true".to_string());
        }
        if self.max_size > 0 {
            args.push(format!("max_size={}", self.max_size));
        }
        if self.max_fps > 0 {
            args.push(format!("max_fps={}", self.max_fps));
        }
        if self.video_bit_rate > 0 {
            args.push(format!("video_bit_rate={}", self.video_bit_rate));
        }
        args.push(format!("video_codec={}", self.codec.server_name()));
        if self.stay_awake {
            args.push("stay_awake=true".to_string());
        }
        args.push("raw_stream=true".to_string());

        args
    }

    /// Full shell command line that starts the server.
    pub fn to_command(&self) -> Vec<String> {
        let mut command = vec![
            format!("CLASSPATH={}", SERVER_REMOTE_PATH),
            "app_process".to_string(),
            "/".to_string(),
            SERVER_MAIN_CLASS.to_string(),
        ];
        command.extend(self.to_args());
        command
    }
}

/// Receiver side of a server's exit code.
#[derive(Debug, Clone)]
pub struct ExitWatch(watch::Receiver<Option<i32>>);

impl ExitWatch {
    /// Exit code, if the server has exited.
    pub fn code(&self) -> Option<i32> {
        *self.0.borrow()
    }

    /// Wait for the server to exit. `None` if the supervisor went away
    /// without reporting.
    pub async fn wait(&mut self) -> Option<i32> {
        match self.0.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        }
    }
}

/// A running server owned by a supervisor task.
///
/// The supervisor waits for the process and publishes its exit code;
/// terminating goes through the supervisor so the child has one owner.
#[derive(Debug)]
pub struct ServerProcess {
    exit: ExitWatch,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl ServerProcess {
    /// Start supervising `process`. Must be called within a tokio runtime.
    pub fn spawn(mut process: Box<dyn RemoteProcess>) -> Self {
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let supervisor = tokio::spawn(async move {
            let exited = tokio::select! {
                result = process.wait() => Some(result),
                _ = token.cancelled() => None,
            };

            let result = match exited {
                Some(result) => result,
                None => {
                    debug!("Killing server process");
                    if let Err(e) = process.kill().await {
                        warn!("Failed to kill server: {}", e);
                    }
                    process.wait().await
                }
            };

            let code = result.unwrap_or_else(|e| {
                warn!("Failed to observe server exit: {}", e);
                -1
            });
            info!(exit_code = code, "Server process exited");
            let _ = tx.send(Some(code));
        });

        Self {
            exit: ExitWatch(rx),
            cancel,
            supervisor: Some(supervisor),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.code()
    }

    pub fn is_running(&self) -> bool {
        self.exit_code().is_none()
    }

    /// A receiver for the exit code, for monitoring.
    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    /// Kill the server if it is still running and wait up to `grace` for
    /// the exit code. Idempotent.
    pub async fn terminate(&mut self, grace: Duration) -> Option<i32> {
        self.cancel.cancel();

        let mut exit = self.exit.clone();
        match tokio::time::timeout(grace, exit.wait()).await {
            Ok(code) => {
                self.supervisor = None;
                code
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Server did not exit in time");
                if let Some(supervisor) = self.supervisor.take() {
                    supervisor.abort();
                }
                None
            }
        }
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::testing::{FakeBridge, KILLED_EXIT_CODE};

    fn args(mode: TunnelMode) -> ServerArgs {
        let config = SessionConfiguration {
            max_size: 1920,
            max_fps: 60,
            bit_rate: 8_000_000,
            stay_awake: true,
            ..Default::default()
        };
        ServerArgs::new(&config, 0x2a, mode)
    }

    #[test]
    fn test_args_order_forward() {
        assert_eq!(
            args(TunnelMode::Forward).to_args(),
            vec![
                "3.3.4",
                "scid=0000002a",
                "log_level=info",
                "audio=false",
                "control=false",
                "tunnel_forward=true",
                "max_size=1920",
                "max_fps=60",
                "video_bit_rate=8000000",
                "video_codec=h264",
                "stay_awake=true",
                "raw_stream=true",
            ]
        );
    }

    #[test]
    fn test_args_omit_unset_options() {
        let mut server = args(TunnelMode::Reverse);
        server.max_size = 0;
        server.max_fps = 0;
        server.video_bit_rate = 0;
        server.stay_awake = false;
        server.codec = VideoCodec::H265;

        assert_eq!(
            server.to_args(),
            vec![
                "3.3.4",
                "scid=0000002a",
                "log_level=info",
                "audio=false",
                "control=false",
                "video_codec=h265",
                "raw_stream=true",
            ]
        );
    }

    #[test]
    fn test_command_prefix() {
        let command = args(TunnelMode::Reverse).to_command();
        assert_eq!(
            &command[..5],
            &[
                "CLASSPATH=/data/local/tmp/scrcpy-server.jar",
                "app_process",
                "/",
                "com.genymobile.scrcpy.Server",
                "3.3.4",
            ]
        );
    }

    #[test]
    fn test_normal_exit_codes() {
        assert!(is_normal_exit(0));
        assert!(is_normal_exit(15));
        assert!(is_normal_exit(143));
        assert!(!is_normal_exit(1));
        assert!(!is_normal_exit(KILLED_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_exit_code_published() {
        let bridge = FakeBridge::default();
        let process = bridge.spawn_shell(&["true".into()]).await.unwrap();
        let server = ServerProcess::spawn(process);
        let mut exit = server.exit_watch();
        assert!(server.is_running());

        bridge.exit_process(1);
        assert_eq!(exit.wait().await, Some(1));
        assert_eq!(server.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let bridge = FakeBridge::default();
        let process = bridge.spawn_shell(&["true".into()]).await.unwrap();
        let mut server = ServerProcess::spawn(process);

        let grace = Duration::from_secs(1);
        assert_eq!(server.terminate(grace).await, Some(KILLED_EXIT_CODE));
        assert_eq!(server.terminate(grace).await, Some(KILLED_EXIT_CODE));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_keeps_code() {
        let bridge = FakeBridge::default();
        let process = bridge.spawn_shell(&["true".into()]).await.unwrap();
        let mut server = ServerProcess::spawn(process);
        let mut exit = server.exit_watch();

        bridge.exit_process(15);
        exit.wait().await;
        assert_eq!(server.terminate(Duration::from_secs(1)).await, Some(15));
    }
}
