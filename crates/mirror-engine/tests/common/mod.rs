//! Fake device, bridge and decoder for engine tests.
//!
//! The fake bridge runs a fake server: once launched it connects to the
//! desktop listener (reverse tunnel) or accepts on the forwarded port
//! (forward tunnel) and writes a canned Annex-B stream.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use mirror_decoder::{
    DecodedImage, DecoderBackend, DecoderEvent, DecoderResult, FormatDescription,
    HardwareSession, ImageBuffer,
};
use mirror_engine::{Collaborators, DeviceRegistry, DeviceSource};
use mirror_ipc::{SessionConfiguration, SourceEvent, SourceState, TimingConfig};
use mirror_launcher::{Bridge, LauncherError, LauncherResult, RemoteProcess, Toolchain};
use mirror_transport::TcpDialer;

pub const SERIAL: &str = "emulator-5554";

/// SPS, PPS, IDR, P slice, then an access unit delimiter that stays
/// buffered because no start code follows it.
pub const H264_STREAM: &[u8] = &[
    0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1f, 0xe9, //
    0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x3c, 0x80, //
    0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, 0x00, //
    0x00, 0x00, 0x01, 0x41, 0x9a, 0x02, //
    0x00, 0x00, 0x00, 0x01, 0x09, 0xf0,
];

/// Frames [`H264_STREAM`] decodes to.
pub const H264_STREAM_FRAMES: usize = 2;

/// Parameter sets and an IDR followed by `frames` P slices of `frame_len`
/// bytes each.
pub fn long_h264_stream(frames: usize, frame_len: usize) -> Vec<u8> {
    let mut data = H264_STREAM[..24].to_vec();
    for _ in 0..frames {
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x41]);
        data.resize(data.len() + frame_len, 0x9a);
    }
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x09, 0xf0]);
    data
}

/// Exit code a killed `adb shell` reports.
pub const KILLED: i32 = 137;

/// Free loopback port.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn config() -> SessionConfiguration {
    SessionConfiguration {
        serial: SERIAL.into(),
        local_port: free_port(),
        timing: TimingConfig {
            connect_retries: 5,
            connect_retry_delay_ms: 20,
            server_settle_ms: 20,
            accept_timeout_ms: 2_000,
            shutdown_grace_ms: 200,
        },
        ..Default::default()
    }
}

/// Server payload file, removed on drop.
pub struct Payload(PathBuf);

impl Payload {
    pub fn create() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "mirror-engine-{}-{}.jar",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, b"payload").unwrap();
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

pub struct FakeToolchain(pub Option<PathBuf>);

impl Toolchain for FakeToolchain {
    fn server_path(&self) -> Option<PathBuf> {
        self.0.clone()
    }
}

/// What the fake server does once launched.
#[derive(Debug, Clone, Default)]
pub enum DeviceBehavior {
    /// Send the stream and keep the connection open until the server exits.
    #[default]
    Stream,
    /// Send the stream, then close the connection while the server runs on.
    StreamThenClose,
    /// Never connect.
    Silent,
}

#[derive(Default)]
pub struct FakeBridge {
    pub fail_push: bool,
    pub fail_reverse: bool,
    pub fail_forward: bool,
    /// Launched servers exit immediately with this code.
    pub exit_immediately: Option<i32>,
    /// Exit code reported when a server is killed; 137 if unset.
    pub kill_exit_code: Option<i32>,
    pub device: DeviceBehavior,
    pub stream: Vec<u8>,
    pub(crate) calls: Mutex<Vec<String>>,
    pub(crate) tunnels: Mutex<BTreeSet<String>>,
    pub(crate) reverse_port: Mutex<Option<u16>>,
    pub(crate) forward_port: Mutex<Option<u16>>,
    pub(crate) servers: Mutex<Vec<Arc<watch::Sender<Option<i32>>>>>,
}

impl FakeBridge {
    pub fn streaming() -> Self {
        Self {
            stream: H264_STREAM.to_vec(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn last_shell(&self) -> Option<String> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find_map(|c| c.strip_prefix("shell ").map(str::to_string))
    }

    /// Tunnels still registered.
    pub fn tunnels(&self) -> Vec<String> {
        self.tunnels.lock().iter().cloned().collect()
    }

    /// Make the most recent server exit as if it ended on the device.
    pub fn exit_server(&self, code: i32) {
        if let Some(server) = self.servers.lock().last() {
            server.send_replace(Some(code));
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    async fn push(&self, local: &Path, remote: &str) -> LauncherResult<()> {
        self.record(format!("push {} {}", local.display(), remote));
        if self.fail_push {
            return Err(LauncherError::Bridge {
                command: "push".into(),
                reason: "error: no devices/emulators found".into(),
            });
        }
        Ok(())
    }

    async fn reverse(&self, socket_name: &str, local_port: u16) -> LauncherResult<()> {
        self.record(format!("reverse {} {}", socket_name, local_port));
        if self.fail_reverse {
            return Err(LauncherError::Bridge {
                command: "reverse".into(),
                reason: "error: more than one device/emulator".into(),
            });
        }
        self.tunnels.lock().insert(format!("reverse {}", socket_name));
        *self.reverse_port.lock() = Some(local_port);
        Ok(())
    }

    async fn reverse_remove(&self, socket_name: &str) -> LauncherResult<()> {
        self.record(format!("reverse --remove {}", socket_name));
        self.tunnels.lock().remove(&format!("reverse {}", socket_name));
        Ok(())
    }

    async fn forward(&self, local_port: u16, socket_name: &str) -> LauncherResult<()> {
        self.record(format!("forward {} {}", local_port, socket_name));
        if self.fail_forward {
            return Err(LauncherError::Bridge {
                command: "forward".into(),
                reason: "error: cannot bind listener".into(),
            });
        }
        self.tunnels.lock().insert(format!("forward {}", local_port));
        *self.forward_port.lock() = Some(local_port);
        Ok(())
    }

    async fn forward_remove(&self, local_port: u16) -> LauncherResult<()> {
        self.record(format!("forward --remove {}", local_port));
        self.tunnels.lock().remove(&format!("forward {}", local_port));
        Ok(())
    }

    async fn spawn_shell(&self, command: &[String]) -> LauncherResult<Box<dyn RemoteProcess>> {
        self.record(format!("shell {}", command.join(" ")));

        let (tx, rx) = watch::channel(self.exit_immediately);
        let tx = Arc::new(tx);
        self.servers.lock().push(Arc::clone(&tx));

        if self.exit_immediately.is_none() {
            let forward = command.iter().any(|arg| arg == "tunnel_forward=true");
            let port = match forward {
                true => *self.forward_port.lock(),
                false => *self.reverse_port.lock(),
            };
            let port = port.expect("tunnel set up before launch");
            let link = if forward {
                DeviceLink::Listen(TcpListener::bind(("127.0.0.1", port)).await?)
            } else {
                DeviceLink::Dial(port)
            };
            tokio::spawn(run_device(
                link,
                self.device.clone(),
                self.stream.clone(),
                rx.clone(),
            ));
        }

        Ok(Box::new(FakeProcess {
            tx,
            rx,
            kill_exit_code: self.kill_exit_code.unwrap_or(KILLED),
        }))
    }
}

enum DeviceLink {
    Dial(u16),
    Listen(TcpListener),
}

async fn run_device(
    link: DeviceLink,
    behavior: DeviceBehavior,
    stream: Vec<u8>,
    mut exit: watch::Receiver<Option<i32>>,
) {
    if matches!(behavior, DeviceBehavior::Silent) {
        return;
    }

    let session = async move {
        let mut socket = match link {
            DeviceLink::Dial(port) => dial(port).await?,
            DeviceLink::Listen(listener) => listener.accept().await.ok()?.0,
        };
        socket.write_all(&stream).await.ok()?;
        socket.flush().await.ok()?;
        Some(socket)
    };

    let socket = tokio::select! {
        socket = session => socket,
        _ = exit.wait_for(Option::is_some) => None,
    };
    let Some(mut socket) = socket else {
        return;
    };

    if matches!(behavior, DeviceBehavior::StreamThenClose) {
        let _ = socket.shutdown().await;
        return;
    }

    let _ = exit.wait_for(Option::is_some).await;
}

async fn dial(port: u16) -> Option<TcpStream> {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return Some(stream);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

struct FakeProcess {
    tx: Arc<watch::Sender<Option<i32>>>,
    rx: watch::Receiver<Option<i32>>,
    kill_exit_code: i32,
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
        let code = self.kill_exit_code;
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// Decoder backend producing one frame per submitted sample.
#[derive(Default)]
pub struct FakeBackend {
    pub opens: Arc<AtomicUsize>,
    pub decodes: Arc<AtomicUsize>,
    pub invalidations: Arc<AtomicUsize>,
    /// Time each decode takes.
    pub decode_delay: Duration,
}

impl FakeBackend {
    pub fn slow(decode_delay: Duration) -> Self {
        Self {
            decode_delay,
            ..Default::default()
        }
    }
}

struct FakeSession {
    decodes: Arc<AtomicUsize>,
    invalidations: Arc<AtomicUsize>,
    output: Sender<DecoderEvent>,
    delay: Duration,
}

impl HardwareSession for FakeSession {
    fn decode(&mut self, sample: Bytes, pts: Duration) -> DecoderResult<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let _ = self.output.try_send(DecoderEvent::Frame(DecodedImage {
            image: ImageBuffer::new(sample),
            width: 1080,
            height: 2400,
            pts,
        }));
        Ok(())
    }

    fn invalidate(&mut self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

impl DecoderBackend for FakeBackend {
    fn open(
        &self,
        _format: &FormatDescription,
        output: Sender<DecoderEvent>,
    ) -> DecoderResult<Box<dyn HardwareSession>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            decodes: Arc::clone(&self.decodes),
            invalidations: Arc::clone(&self.invalidations),
            output,
            delay: self.decode_delay,
        }))
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// A source wired to fakes.
pub struct Harness {
    pub source: DeviceSource,
    pub bridge: Arc<FakeBridge>,
    pub backend: Arc<FakeBackend>,
    pub registry: DeviceRegistry,
    pub events: Receiver<SourceEvent>,
    _payload: Payload,
}

impl Harness {
    pub fn new(bridge: FakeBridge) -> Self {
        Self::with_config(bridge, config())
    }

    pub fn with_config(bridge: FakeBridge, config: SessionConfiguration) -> Self {
        let payload = Payload::create();
        let toolchain = FakeToolchain(Some(payload.path().to_path_buf()));
        Self::build(bridge, config, toolchain, payload)
    }

    pub fn without_server(bridge: FakeBridge) -> Self {
        let toolchain = FakeToolchain(Some(PathBuf::from("/nonexistent/scrcpy-server")));
        Self::build(bridge, config(), toolchain, Payload::create())
    }

    fn build(
        bridge: FakeBridge,
        config: SessionConfiguration,
        toolchain: FakeToolchain,
        payload: Payload,
    ) -> Self {
        let bridge = Arc::new(bridge);
        let backend = Arc::new(FakeBackend::default());
        let registry = DeviceRegistry::new();
        let (event_tx, events) = mirror_ipc::event_channel();

        let source = DeviceSource::new(
            config,
            Collaborators {
                bridge: bridge.clone(),
                toolchain: Arc::new(toolchain),
                backend: backend.clone(),
                dialer: Arc::new(TcpDialer),
                registry: registry.clone(),
            },
            event_tx,
        );

        Self {
            source,
            bridge,
            backend,
            registry,
            events,
            _payload: payload,
        }
    }

    /// States entered so far, in order.
    pub fn states(&self) -> Vec<SourceState> {
        self.events
            .try_iter()
            .filter_map(|event| match event {
                SourceEvent::StateChanged { current, .. } => Some(*current),
                SourceEvent::Stats(_) => None,
            })
            .collect()
    }

    /// Poll until the source state matches.
    pub async fn wait_for_state<F>(&self, predicate: F) -> SourceState
    where
        F: Fn(&SourceState) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let state = self.source.state();
            if predicate(&state) {
                return state;
            }
            assert!(Instant::now() < deadline, "timed out in state {:?}", state);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `count` frames have been delivered.
    pub async fn wait_for_frames(&self, count: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.source.stats().frames_delivered < count {
            assert!(Instant::now() < deadline, "timed out waiting for frames");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
