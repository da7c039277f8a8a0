//! In-memory bridge for launcher tests.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::bridge::{Bridge, RemoteProcess};
use crate::error::LauncherError;
use crate::LauncherResult;

/// Exit code of a killed `adb shell` (SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Default)]
pub struct FakeBridge {
    pub fail_push: bool,
    pub fail_reverse: bool,
    pub fail_forward: bool,
    /// Spawned processes exit immediately with this code.
    pub exit_immediately: Option<i32>,
    pub calls: Mutex<Vec<(String, String)>>,
    pub active: Mutex<BTreeSet<String>>,
    pub processes: Mutex<Vec<Arc<watch::Sender<Option<i32>>>>>,
}

impl FakeBridge {
    /// Number of calls of `verb`, e.g. `"forward"` or `"forward --remove"`.
    pub fn count(&self, verb: &str) -> usize {
        self.calls.lock().iter().filter(|(v, _)| v == verb).count()
    }

    /// Command line of the last spawned shell.
    pub fn last_shell(&self) -> Option<String> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(v, _)| v == "shell")
            .map(|(_, detail)| detail.clone())
    }

    /// Tunnels currently registered.
    pub fn tunnels(&self) -> Vec<String> {
        self.active.lock().iter().cloned().collect()
    }

    /// Make the most recently spawned process exit.
    pub fn exit_process(&self, code: i32) {
        if let Some(tx) = self.processes.lock().last() {
            tx.send_replace(Some(code));
        }
    }

    fn record(&self, verb: &str, detail: String) {
        self.calls.lock().push((verb.to_string(), detail));
    }

    fn fail(command: String) -> LauncherError {
        LauncherError::Bridge {
            command,
            reason: "error: closed".into(),
        }
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    async fn push(&self, local: &Path, remote: &str) -> LauncherResult<()> {
        self.record("push", format!("{} {}", local.display(), remote));
        if self.fail_push {
            return Err(Self::fail("push".into()));
        }
        Ok(())
    }

    async fn reverse(&self, socket_name: &str, local_port: u16) -> LauncherResult<()> {
        self.record("reverse", format!("{} {}", socket_name, local_port));
        if self.fail_reverse {
            return Err(Self::fail(format!("reverse localabstract:{}", socket_name)));
        }
        self.active.lock().insert(format!("reverse {}", socket_name));
        Ok(())
    }

    async fn reverse_remove(&self, socket_name: &str) -> LauncherResult<()> {
        self.record("reverse --remove", socket_name.to_string());
        self.active.lock().remove(&format!("reverse {}", socket_name));
        Ok(())
    }

    async fn forward(&self, local_port: u16, socket_name: &str) -> LauncherResult<()> {
        self.record("forward", format!("{} {}", local_port, socket_name));
        if self.fail_forward {
            return Err(Self::fail(format!("forward tcp:{}", local_port)));
        }
        self.active.lock().insert(format!("forward {}", local_port));
        Ok(())
    }

    async fn forward_remove(&self, local_port: u16) -> LauncherResult<()> {
        self.record("forward --remove", local_port.to_string());
        self.active.lock().remove(&format!("forward {}", local_port));
        Ok(())
    }

    async fn spawn_shell(&self, command: &[String]) -> LauncherResult<Box<dyn RemoteProcess>> {
        self.record("shell", command.join(" "));
        let (tx, rx) = watch::channel(self.exit_immediately);
        let tx = Arc::new(tx);
        self.processes.lock().push(Arc::clone(&tx));
        Ok(Box::new(FakeProcess { tx, rx }))
    }
}

pub struct FakeProcess {
    tx: Arc<watch::Sender<Option<i32>>>,
    rx: watch::Receiver<Option<i32>>,
}

#[async_trait]
impl RemoteProcess for FakeProcess {
    async fn wait(&mut self) -> LauncherResult<i32> {
        let code = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| LauncherError::ServerLaunch(e.to_string()))?;
        Ok((*code).unwrap_or(-1))
    }

    async fn kill(&mut self) -> LauncherResult<()> {
        self.tx.send_if_modified(|code| {
            if code.is_none() {
                *code = Some(KILLED_EXIT_CODE);
                true
            } else {
                false
            }
        });
        Ok(())
    }
}
