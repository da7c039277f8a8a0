//! Environment preparation and server lifecycle for one device.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use mirror_ipc::SessionConfiguration;

use crate::bridge::Bridge;
use crate::error::LauncherError;
use crate::server::{ExitWatch, ServerArgs, ServerProcess, SERVER_REMOTE_PATH};
use crate::toolchain::Toolchain;
use crate::tunnel::{random_scid, TunnelHandle};
use crate::LauncherResult;

/// Owns the tunnel and the server process of one capture.
pub struct Launcher {
    bridge: Arc<dyn Bridge>,
    toolchain: Arc<dyn Toolchain>,
    tunnel: Option<TunnelHandle>,
    server: Option<ServerProcess>,
}

impl Launcher {
    pub fn new(bridge: Arc<dyn Bridge>, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            bridge,
            toolchain,
            tunnel: None,
            server: None,
        }
    }

    /// The negotiated tunnel, if any.
    pub fn tunnel(&self) -> Option<&TunnelHandle> {
        self.tunnel.as_ref()
    }

    /// Push the payload and set up a tunnel.
    ///
    /// Returns a copy of the negotiated tunnel.
    #[instrument(name = "prepare_environment", skip_all, fields(serial = %config.serial))]
    pub async fn prepare_environment(
        &mut self,
        config: &SessionConfiguration,
    ) -> LauncherResult<TunnelHandle> {
        let local = self
            .toolchain
            .server_path()
            .ok_or_else(|| LauncherError::PayloadMissing("no server path configured".into()))?;
        if !local.is_file() {
            return Err(LauncherError::PayloadMissing(local.display().to_string()));
        }

        self.bridge
            .push(&local, SERVER_REMOTE_PATH)
            .await
            .map_err(|e| LauncherError::PushFailed(e.to_string()))?;
        info!(remote = SERVER_REMOTE_PATH, "Server pushed");

        let scid = random_scid();
        let tunnel = TunnelHandle::negotiate(self.bridge.as_ref(), scid, config.local_port).await?;
        self.tunnel = Some(tunnel.clone());

        Ok(tunnel)
    }

    /// Launch the server and check it survives the settle delay.
    #[instrument(name = "start_server", skip_all)]
    pub async fn start_server(&mut self, config: &SessionConfiguration) -> LauncherResult<ExitWatch> {
        let tunnel = self.tunnel.as_ref().ok_or(LauncherError::NotPrepared)?;
        let args = ServerArgs::new(config, tunnel.scid, tunnel.mode);

        let process = self.bridge.spawn_shell(&args.to_command()).await?;
        let server = ServerProcess::spawn(process);
        let exit = server.exit_watch();

        tokio::time::sleep(config.timing.server_settle()).await;

        if let Some(code) = server.exit_code() {
            warn!(exit_code = code, "Server exited during startup");
            return Err(LauncherError::ServerExited(code));
        }

        info!(socket = %tunnel.socket_name, mode = %tunnel.mode, "Server running");
        self.server = Some(server);
        Ok(exit)
    }

    /// Terminate the server if running. Returns its exit code if known.
    pub async fn terminate_server(&mut self, grace: Duration) -> Option<i32> {
        let mut server = self.server.take()?;
        server.terminate(grace).await
    }

    /// Remove the tunnel if one exists.
    pub async fn remove_tunnel(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.remove(self.bridge.as_ref()).await;
        }
    }

    /// Terminate the server, then remove the tunnel. Idempotent.
    pub async fn stop(&mut self, grace: Duration) {
        self.terminate_server(grace).await;
        self.remove_tunnel().await;
    }
}
