//! Capture resources with ordered startup and shutdown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use mirror_decoder::ChunkSender;
use mirror_ipc::{SessionConfiguration, ShutdownPhase, StartupPhase};
use mirror_launcher::{ExitWatch, Launcher, LauncherError, TunnelMode};
use mirror_transport::{
    Dialer, ReadLoopHandle, RetryPolicy, TransportError, VideoListener, VideoSocket,
};

use crate::error::{EngineError, StartupError};
use crate::metrics::MetricsCollector;
use crate::monitor::Notice;
use crate::registry::DeviceLease;

/// What the startup phases need from the source.
pub struct StartupContext {
    pub dialer: Arc<dyn Dialer>,

    /// Destination of the raw stream.
    pub chunks: ChunkSender,

    pub metrics: Arc<MetricsCollector>,

    /// Receives [`Notice::StreamEnded`] when the read loop finishes.
    pub notices: UnboundedSender<Notice>,
}

/// Resources held by a running capture.
#[derive(Default)]
pub struct CaptureResources {
    pub lease: Option<DeviceLease>,
    pub listener: Option<VideoListener>,
    pub socket: Option<VideoSocket>,
    pub reader: Option<ReadLoopHandle>,
    pub exit: Option<ExitWatch>,
}

/// Brings a capture up phase by phase and tears it down in a fixed order.
pub struct ResourceManager {
    launcher: Launcher,
    resources: CaptureResources,
    current_phase: Option<StartupPhase>,
}

impl ResourceManager {
    /// The lease is released as the last shutdown phase.
    pub fn new(launcher: Launcher, lease: DeviceLease) -> Self {
        Self {
            launcher,
            resources: CaptureResources {
                lease: Some(lease),
                ..Default::default()
            },
            current_phase: None,
        }
    }

    /// The phase being run or that last ran.
    pub fn current_phase(&self) -> Option<StartupPhase> {
        self.current_phase
    }

    /// Exit watch of the running server.
    pub fn exit_watch(&self) -> Option<ExitWatch> {
        self.resources.exit.clone()
    }

    pub fn tunnel_mode(&self) -> Option<TunnelMode> {
        self.launcher.tunnel().map(|t| t.mode)
    }

    /// Run startup phases up to and including `target_phase`.
    ///
    /// On failure the resources of the phases that did run stay held; call
    /// [`Self::rollback`].
    #[instrument(name = "init_resources", skip_all)]
    pub async fn initialize(
        &mut self,
        config: &SessionConfiguration,
        ctx: &StartupContext,
        target_phase: StartupPhase,
    ) -> Result<(), StartupError> {
        let mut phase = StartupPhase::PrepareEnvironment;

        loop {
            self.current_phase = Some(phase);
            self.init_phase(config, ctx, phase)
                .await
                .map_err(|e| StartupError::new(phase, e))?;

            if phase == target_phase {
                break;
            }

            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        Ok(())
    }

    async fn init_phase(
        &mut self,
        config: &SessionConfiguration,
        ctx: &StartupContext,
        phase: StartupPhase,
    ) -> Result<(), EngineError> {
        debug!("Startup phase: {}", phase.name());

        match phase {
            StartupPhase::PrepareEnvironment => {
                self.launcher.prepare_environment(config).await?;
            }
            StartupPhase::OpenTransport => self.open_transport().await?,
            StartupPhase::StartServer => {
                let exit = self.launcher.start_server(config).await?;
                self.resources.exit = Some(exit);
            }
            StartupPhase::ConnectTransport => self.connect_transport(config, ctx).await?,
            StartupPhase::StartReadLoop => self.start_read_loop(ctx)?,
        }

        Ok(())
    }

    /// Reverse tunnels need the listener up before the server dials out.
    async fn open_transport(&mut self) -> Result<(), EngineError> {
        let tunnel = self.launcher.tunnel().ok_or(LauncherError::NotPrepared)?;
        if tunnel.mode.is_forward() {
            trace!("Forward tunnel, nothing to listen on");
            return Ok(());
        }

        let listener = VideoListener::bind(tunnel.local_port).await?;
        self.resources.listener = Some(listener);
        Ok(())
    }

    async fn connect_transport(
        &mut self,
        config: &SessionConfiguration,
        ctx: &StartupContext,
    ) -> Result<(), EngineError> {
        let tunnel = self.launcher.tunnel().ok_or(LauncherError::NotPrepared)?;

        let socket = match tunnel.mode {
            TunnelMode::Reverse => {
                let listener = self
                    .resources
                    .listener
                    .take()
                    .ok_or(TransportError::NotConnected)?;
                listener.accept(config.timing.accept_timeout()).await?
            }
            TunnelMode::Forward => {
                let policy = RetryPolicy::new(
                    config.timing.connect_retries,
                    config.timing.connect_retry_delay(),
                );
                VideoSocket::connect(ctx.dialer.as_ref(), tunnel.local_port, &policy).await?
            }
        };

        self.resources.socket = Some(socket);
        Ok(())
    }

    fn start_read_loop(&mut self, ctx: &StartupContext) -> Result<(), EngineError> {
        let socket = self
            .resources
            .socket
            .as_mut()
            .ok_or(TransportError::NotConnected)?;

        let chunks = ctx.chunks.clone();
        let metrics = Arc::clone(&ctx.metrics);
        let notices = ctx.notices.clone();

        let reader = socket.spawn_read_loop(
            CancellationToken::new(),
            move |chunk: Bytes| {
                metrics.record_bytes(chunk.len() as u64);
                trace!(len = chunk.len(), "Stream chunk");
                let chunks = chunks.clone();
                async move {
                    if !chunks.send(chunk).await {
                        trace!("Decode queue closed, chunk dropped");
                    }
                }
            },
            move |outcome| {
                let _ = notices.send(Notice::StreamEnded(outcome));
            },
        )?;

        self.resources.reader = Some(reader);
        info!("Video stream started");
        Ok(())
    }

    /// Release whatever a failed startup left behind.
    #[instrument(name = "rollback_resources", skip(self))]
    pub async fn rollback(&mut self, grace: Duration) -> Vec<ShutdownPhase> {
        if let Some(phase) = self.current_phase {
            info!("Rolling back from phase: {}", phase.name());
        }
        self.shutdown(grace).await
    }

    /// Release all resources in shutdown order.
    ///
    /// Returns the phases that had something to release. Calling it again
    /// returns an empty list.
    #[instrument(name = "shutdown_resources", skip(self))]
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<ShutdownPhase> {
        let mut ran = Vec::new();
        let mut phase = ShutdownPhase::FIRST;

        loop {
            if self.shutdown_phase(phase, grace).await {
                debug!("Shutdown phase: {}", phase.name());
                ran.push(phase);
            }

            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        self.current_phase = None;
        ran
    }

    async fn shutdown_phase(&mut self, phase: ShutdownPhase, grace: Duration) -> bool {
        let resources = &mut self.resources;

        match phase {
            ShutdownPhase::CancelReader => match &resources.reader {
                Some(reader) => {
                    reader.cancel();
                    true
                }
                None => false,
            },
            ShutdownPhase::ShutdownRead => match &resources.reader {
                Some(reader) => {
                    reader.shutdown_read();
                    true
                }
                None => false,
            },
            ShutdownPhase::AwaitReader => match resources.reader.as_mut() {
                Some(reader) => {
                    let outcome = reader.join(grace).await;
                    debug!(?outcome, bytes = reader.bytes_read(), "Reader stopped");
                    true
                }
                None => false,
            },
            ShutdownPhase::CloseSocket => {
                let mut closed = false;
                if let Some(mut reader) = resources.reader.take() {
                    reader.close();
                    closed = true;
                }
                closed |= resources.socket.take().is_some();
                closed |= resources.listener.take().is_some();
                closed
            }
            ShutdownPhase::TerminateServer => {
                if resources.exit.take().is_none() {
                    return false;
                }
                match self.launcher.terminate_server(grace).await {
                    Some(code) => debug!(exit_code = code, "Server terminated"),
                    None => warn!("Server exit code unknown after terminate"),
                }
                true
            }
            ShutdownPhase::RemoveTunnel => {
                if self.launcher.tunnel().is_none() {
                    return false;
                }
                self.launcher.remove_tunnel().await;
                true
            }
            ShutdownPhase::ReleaseDevice => resources.lease.take().is_some(),
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if let Some(tunnel) = self.launcher.tunnel() {
            warn!(socket = %tunnel.socket_name, "Capture dropped without shutdown, tunnel left in place");
        }
    }
}
