//! The device source state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use mirror_decoder::{DecodeQueue, DecoderBackend, DECODED_CHANNEL_CAPACITY};
use mirror_ipc::{
    CaptureError, SessionConfiguration, SourceEvent, SourceState, StartupPhase, StopReason,
    StreamStats,
};
use mirror_launcher::{Bridge, ExitWatch, Launcher, Toolchain};
use mirror_transport::{Dialer, ReadOutcome};

use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::monitor::{resolve, spawn_exit_forwarder, Notice};
use crate::pump::{CaptureFrame, FramePump, LatestFrame, PumpOutputs, FRAME_CHANNEL_CAPACITY};
use crate::registry::DeviceRegistry;
use crate::state::{ResourceManager, StartupContext};

/// External services a source depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub bridge: Arc<dyn Bridge>,
    pub toolchain: Arc<dyn Toolchain>,
    pub backend: Arc<dyn DecoderBackend>,
    pub dialer: Arc<dyn Dialer>,
    pub registry: DeviceRegistry,
}

/// Decode queue plus the thread delivering its output.
struct DecodePipeline {
    queue: DecodeQueue,
    pump: FramePump,
}

impl DecodePipeline {
    /// Join the worker threads without stalling the runtime.
    async fn shutdown(mut self) {
        let joined = tokio::task::spawn_blocking(move || {
            self.queue.shutdown();
            self.pump.stop();
        })
        .await;
        if let Err(e) = joined {
            error!("Decode pipeline shutdown failed: {}", e);
        }
    }
}

/// State changed only under the control lock.
#[derive(Default)]
struct Control {
    pipeline: Option<DecodePipeline>,
    capture: Option<ResourceManager>,
    monitor: Option<CancellationToken>,
}

impl Drop for Control {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
        }
    }
}

struct Inner {
    config: SessionConfiguration,
    collaborators: Collaborators,
    state: Arc<RwLock<SourceState>>,
    event_tx: Sender<SourceEvent>,
    frame_tx: Sender<CaptureFrame>,
    frame_rx: Receiver<CaptureFrame>,
    latest: LatestFrame,
    metrics: Arc<MetricsCollector>,
    stop_requested: AtomicBool,
    control: Mutex<Control>,
}

/// One mirrored Android device.
///
/// Operations are serialized; each one runs to completion before the next
/// starts. State changes are published as [`SourceEvent::StateChanged`].
pub struct DeviceSource {
    inner: Arc<Inner>,
}

impl DeviceSource {
    pub fn new(
        config: SessionConfiguration,
        collaborators: Collaborators,
        event_tx: Sender<SourceEvent>,
    ) -> Self {
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(FRAME_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                collaborators,
                state: Arc::new(RwLock::new(SourceState::Idle)),
                event_tx,
                frame_tx,
                frame_rx,
                latest: LatestFrame::default(),
                metrics: Arc::new(MetricsCollector::new()),
                stop_requested: AtomicBool::new(false),
                control: Mutex::new(Control::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfiguration {
        &self.inner.config
    }

    pub fn state(&self) -> SourceState {
        self.inner.state.read().clone()
    }

    pub fn stats(&self) -> StreamStats {
        self.inner.metrics.snapshot()
    }

    /// The most recently decoded frame.
    pub fn latest_frame(&self) -> Option<CaptureFrame> {
        self.inner.latest.lock().clone()
    }

    /// Receiver for decoded frames. New frames are dropped while it is full.
    pub fn frames(&self) -> Receiver<CaptureFrame> {
        self.inner.frame_rx.clone()
    }

    /// Build the decode pipeline.
    ///
    /// Allowed from Idle, Disconnected and Error; does nothing if already
    /// connected or capturing.
    #[instrument(name = "connect", skip(self), fields(serial = %self.inner.config.serial))]
    pub async fn connect(&self) -> Result<(), CaptureError> {
        let mut control = self.inner.control.lock().await;

        let state = self.state();
        if state.is_connected() || state.is_capturing() {
            debug!("Already connected, ignoring connect");
            return Ok(());
        }

        self.inner.transition_to(SourceState::Connecting);

        let toolchain = &self.inner.collaborators.toolchain;
        if !toolchain.server_available() {
            let location = toolchain
                .server_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "no path configured".to_string());
            let err = CaptureError::ConnectionFailed(format!("mirroring server not found ({location})"));
            error!("Connect failed: {}", err);
            self.inner.transition_to(SourceState::Error(err.clone()));
            return Err(err);
        }

        if let Some(stale) = control.pipeline.take() {
            stale.shutdown().await;
        }

        match self.inner.spawn_pipeline() {
            Ok(pipeline) => control.pipeline = Some(pipeline),
            Err(e) => {
                let err = CaptureError::ConnectionFailed(e.to_string());
                error!("Connect failed: {}", err);
                self.inner.transition_to(SourceState::Error(err.clone()));
                return Err(err);
            }
        }

        self.inner.transition_to(SourceState::Connected);
        info!(codec = %self.inner.config.codec, "Source connected");
        Ok(())
    }

    /// Start the server and the video stream.
    ///
    /// Requires Connected; does nothing if already capturing. A failed
    /// start releases everything it acquired before the source enters Error.
    #[instrument(name = "start_capture", skip(self), fields(serial = %self.inner.config.serial))]
    pub async fn start_capture(&self) -> Result<(), CaptureError> {
        let mut control = self.inner.control.lock().await;
        let inner = &self.inner;
        let config = &inner.config;

        let state = self.state();
        if state.is_capturing() {
            debug!("Already capturing, ignoring start");
            return Ok(());
        }

        let chunks = match control.pipeline.as_ref() {
            Some(pipeline) if state.is_connected() => {
                pipeline.queue.reset().await;
                pipeline.queue.chunk_sender()
            }
            _ => {
                return Err(CaptureError::CaptureStartFailed(format!(
                    "source is {}, not Connected",
                    state.name()
                )));
            }
        };

        let Some(lease) = inner.collaborators.registry.acquire(&config.serial) else {
            let err = CaptureError::DeviceInUse(config.serial.clone());
            warn!("Capture start failed: {}", err);
            inner.transition_to(SourceState::Error(err.clone()));
            return Err(err);
        };

        info!("Starting capture");
        inner.stop_requested.store(false, Ordering::SeqCst);
        inner.metrics.start();

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let ctx = StartupContext {
            dialer: Arc::clone(&inner.collaborators.dialer),
            chunks,
            metrics: Arc::clone(&inner.metrics),
            notices: notice_tx.clone(),
        };

        let launcher = Launcher::new(
            Arc::clone(&inner.collaborators.bridge),
            Arc::clone(&inner.collaborators.toolchain),
        );
        let mut capture = ResourceManager::new(launcher, lease);

        if let Err(e) = capture
            .initialize(config, &ctx, StartupPhase::StartReadLoop)
            .await
        {
            error!("Capture start failed: {}", e);
            let phases = capture.rollback(config.timing.shutdown_grace()).await;
            debug!(?phases, "Rollback complete");
            inner.metrics.stop();

            let err = e.to_capture_error();
            inner.transition_to(SourceState::Error(err.clone()));
            return Err(err);
        }

        let monitor = CancellationToken::new();
        let exit = capture.exit_watch();
        if let Some(exit) = exit.clone() {
            spawn_exit_forwarder(exit, monitor.clone(), notice_tx);
        }
        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            notice_rx,
            monitor.clone(),
            exit,
        ));

        let mode = capture.tunnel_mode();
        control.capture = Some(capture);
        control.monitor = Some(monitor);

        inner.transition_to(SourceState::Capturing);
        info!(tunnel = ?mode, "Capture started");
        Ok(())
    }

    /// Stop capturing and return to Connected. Does nothing unless a
    /// capture is running.
    #[instrument(name = "stop_capture", skip(self), fields(serial = %self.inner.config.serial))]
    pub async fn stop_capture(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        let mut control = self.inner.control.lock().await;

        if self
            .inner
            .teardown_capture(&mut control, StopReason::UserRequested)
            .await
        {
            self.inner.transition_to(SourceState::Connected);
        } else {
            debug!("No capture running, ignoring stop");
        }
    }

    /// Release everything and enter Disconnected. Always allowed; repeated
    /// calls do nothing further.
    #[instrument(name = "disconnect", skip(self), fields(serial = %self.inner.config.serial))]
    pub async fn disconnect(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        let mut control = self.inner.control.lock().await;

        self.inner
            .teardown_capture(&mut control, StopReason::UserRequested)
            .await;

        if let Some(pipeline) = control.pipeline.take() {
            pipeline.shutdown().await;
            self.inner.metrics.detach_decoder();
        }

        *self.inner.latest.lock() = None;
        while self.inner.frame_rx.try_recv().is_ok() {}

        if *self.inner.state.read() != SourceState::Disconnected {
            self.inner.transition_to(SourceState::Disconnected);
            info!("Source disconnected");
        }
    }

    /// Same as [`Self::disconnect`].
    pub async fn stop(&self) {
        self.disconnect().await;
    }
}

impl Inner {
    fn spawn_pipeline(&self) -> Result<DecodePipeline, EngineError> {
        let (decoded_tx, decoded_rx) = crossbeam_channel::bounded(DECODED_CHANNEL_CAPACITY);

        let queue = DecodeQueue::spawn(
            self.config.codec,
            Arc::clone(&self.collaborators.backend),
            decoded_tx,
        )?;
        self.metrics.attach_decoder(queue.counters());

        let pump = FramePump::spawn(
            decoded_rx,
            PumpOutputs {
                frames: self.frame_tx.clone(),
                latest: Arc::clone(&self.latest),
                events: self.event_tx.clone(),
                state: Arc::clone(&self.state),
                metrics: Arc::clone(&self.metrics),
            },
        )?;

        Ok(DecodePipeline { queue, pump })
    }

    /// Stop monitoring and release the capture. Returns false if no capture
    /// was running.
    async fn teardown_capture(&self, control: &mut Control, reason: StopReason) -> bool {
        if let Some(monitor) = control.monitor.take() {
            monitor.cancel();
        }

        let Some(mut capture) = control.capture.take() else {
            return false;
        };

        info!(reason = %reason.message(), "Stopping capture");
        let phases = capture.shutdown(self.config.timing.shutdown_grace()).await;
        debug!(?phases, "Shutdown sequence complete");
        self.metrics.stop();
        true
    }

    fn transition_to(&self, new_state: SourceState) {
        let previous = {
            let mut state = self.state.write();
            let prev = state.clone();
            *state = new_state.clone();
            prev
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(SourceEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: SourceEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Watch a running capture and end it on the first notice that matters.
async fn supervise(
    inner: Weak<Inner>,
    mut notices: UnboundedReceiver<Notice>,
    monitor: CancellationToken,
    exit: Option<ExitWatch>,
) {
    let notice = loop {
        let notice = tokio::select! {
            _ = monitor.cancelled() => return,
            notice = notices.recv() => match notice {
                Some(notice) => notice,
                None => return,
            },
        };
        if notice != Notice::StreamEnded(ReadOutcome::Cancelled) {
            break notice;
        }
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };

    // The stream usually closes because the server is exiting; give it the
    // grace period to report an exit code.
    let exit_code = match (&notice, exit) {
        (Notice::StreamEnded(_), Some(mut exit)) => match exit.code() {
            Some(code) => Some(code),
            None => tokio::time::timeout(inner.config.timing.shutdown_grace(), exit.wait())
                .await
                .ok()
                .flatten(),
        },
        _ => None,
    };

    let Some((reason, next)) = resolve(&notice, exit_code) else {
        return;
    };

    let mut control = inner.control.lock().await;
    if monitor.is_cancelled() || inner.stop_requested.load(Ordering::SeqCst) {
        debug!(?notice, "Stop already requested, ignoring notice");
        return;
    }
    if !inner.state.read().is_capturing() {
        return;
    }

    match &next {
        SourceState::Error(err) => warn!(?notice, "Capture failed: {}", err),
        _ => info!(?notice, "Capture ended"),
    }

    inner.teardown_capture(&mut control, reason).await;
    inner.transition_to(next);
}
