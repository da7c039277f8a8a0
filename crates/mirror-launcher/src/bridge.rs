//! Access to one device through the adb bridge.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use crate::error::LauncherError;
use crate::LauncherResult;

/// A process running on the device.
#[async_trait]
pub trait RemoteProcess: Send {
    /// Wait for the process to exit.
    async fn wait(&mut self) -> LauncherResult<i32>;

    /// Kill the process. Succeeds if it already exited.
    async fn kill(&mut self) -> LauncherResult<()>;
}

/// Device operations the launcher needs.
///
/// One bridge addresses exactly one device.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Copy a local file to the device.
    async fn push(&self, local: &Path, remote: &str) -> LauncherResult<()>;

    /// Device connects out to `tcp:local_port` on the desktop.
    async fn reverse(&self, socket_name: &str, local_port: u16) -> LauncherResult<()>;

    async fn reverse_remove(&self, socket_name: &str) -> LauncherResult<()>;

    /// Desktop `tcp:local_port` connects in to the device socket.
    async fn forward(&self, local_port: u16, socket_name: &str) -> LauncherResult<()>;

    async fn forward_remove(&self, local_port: u16) -> LauncherResult<()>;

    /// Run a shell command on the device.
    async fn spawn_shell(&self, command: &[String]) -> LauncherResult<Box<dyn RemoteProcess>>;
}

/// [`Bridge`] backed by the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    executable: PathBuf,
    serial: String,
}

impl AdbBridge {
    pub fn new(executable: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            serial: serial.into(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg("-s")
            .arg(&self.serial)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, args: &[&str]) -> LauncherResult<()> {
        let joined = args.join(" ");
        debug!(serial = %self.serial, command = %joined, "Running adb");

        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| LauncherError::Bridge {
                command: joined.clone(),
                reason: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim() {
            "" => format!("exited with {}", output.status),
            message => message.to_string(),
        };
        Err(LauncherError::Bridge {
            command: joined,
            reason,
        })
    }
}

#[async_trait]
impl Bridge for AdbBridge {
    #[instrument(name = "adb_push", skip(self))]
    async fn push(&self, local: &Path, remote: &str) -> LauncherResult<()> {
        let local = local.to_string_lossy();
        self.run(&["push", &local, remote]).await
    }

    async fn reverse(&self, socket_name: &str, local_port: u16) -> LauncherResult<()> {
        let remote = format!("localabstract:{}", socket_name);
        let local = format!("tcp:{}", local_port);
        self.run(&["reverse", &remote, &local]).await
    }

    async fn reverse_remove(&self, socket_name: &str) -> LauncherResult<()> {
        let remote = format!("localabstract:{}", socket_name);
        self.run(&["reverse", "--remove", &remote]).await
    }

    async fn forward(&self, local_port: u16, socket_name: &str) -> LauncherResult<()> {
        let local = format!("tcp:{}", local_port);
        let remote = format!("localabstract:{}", socket_name);
        self.run(&["forward", &local, &remote]).await
    }

    async fn forward_remove(&self, local_port: u16) -> LauncherResult<()> {
        let local = format!("tcp:{}", local_port);
        self.run(&["forward", "--remove", &local]).await
    }

    async fn spawn_shell(&self, command: &[String]) -> LauncherResult<Box<dyn RemoteProcess>> {
        debug!(serial = %self.serial, command = %command.join(" "), "Spawning device shell");

        let mut child = self
            .command()
            .arg("shell")
            .args(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| LauncherError::ServerLaunch(e.to_string()))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        Ok(Box::new(AdbProcess { child }))
    }
}

/// Relay server output lines into the log.
async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "mirror_launcher::server", stream, "{}", line);
    }
}

/// `adb shell` child process.
struct AdbProcess {
    child: Child,
}

#[async_trait]
impl RemoteProcess for AdbProcess {
    async fn wait(&mut self) -> LauncherResult<i32> {
        Ok(exit_code(self.child.wait().await?))
    }

    async fn kill(&mut self) -> LauncherResult<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }
}

/// Exit code, with signal deaths reported shell-style as `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
