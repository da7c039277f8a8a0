//! Mirror an Android device from the command line.
//!
//! ```text
//! mirror --serial R58M123            Mirror one device until Ctrl-C
//! mirror --config mirror.toml        Load settings from a TOML file
//! mirror --print-config              Write the effective config to stdout
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use crossbeam_channel::Receiver;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mirror_engine::{Collaborators, DeviceRegistry};
use mirror_ipc::{SourceEvent, SourceState, VideoCodec};
use mirror_launcher::{AdbBridge, LocalToolchain};
use mirror_transport::TcpDialer;

use crate::config::MirrorConfig;

#[derive(Parser, Debug)]
#[command(name = "mirror", version, about = "Android screen mirroring ingest")]
struct Cli {
    /// Path to a configuration TOML file.
    #[arg(short, long, default_value = "mirror.toml")]
    config: PathBuf,

    /// Device serial.
    #[arg(short, long)]
    serial: Option<String>,

    #[arg(long, value_enum)]
    codec: Option<CodecArg>,

    /// Maximum pixel dimension (0 = unlimited).
    #[arg(long)]
    max_size: Option<u32>,

    /// Encoder bit rate in bits per second.
    #[arg(long)]
    bit_rate: Option<u32>,

    #[arg(long)]
    max_fps: Option<u32>,

    /// Local tunnel port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Server payload to push.
    #[arg(long)]
    server_path: Option<PathBuf>,

    /// The adb executable.
    #[arg(long)]
    adb: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecArg {
    H264,
    H265,
}

impl From<CodecArg> for VideoCodec {
    fn from(codec: CodecArg) -> Self {
        match codec {
            CodecArg::H264 => VideoCodec::H264,
            CodecArg::H265 => VideoCodec::H265,
        }
    }
}

impl Cli {
    fn apply(&self, config: &mut MirrorConfig) {
        let session = &mut config.session;
        if let Some(serial) = &self.serial {
            session.serial = serial.clone();
        }
        if let Some(codec) = self.codec {
            session.codec = codec.into();
        }
        if let Some(max_size) = self.max_size {
            session.max_size = max_size;
        }
        if let Some(bit_rate) = self.bit_rate {
            session.bit_rate = bit_rate;
        }
        if let Some(max_fps) = self.max_fps {
            session.max_fps = max_fps;
        }
        if let Some(port) = self.port {
            session.local_port = port;
        }
        if let Some(path) = &self.server_path {
            config.tools.server_path = path.clone();
        }
        if let Some(adb) = &self.adb {
            config.tools.adb = adb.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = MirrorConfig::load(&cli.config)?;
    cli.apply(&mut config);

    if cli.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("mirror v{}", env!("CARGO_PKG_VERSION"));

    if config.session.serial.is_empty() {
        anyhow::bail!("no device serial given (--serial or session.serial)");
    }

    let collaborators = Collaborators {
        bridge: Arc::new(AdbBridge::new(&config.tools.adb, &config.session.serial)),
        toolchain: Arc::new(LocalToolchain::new(&config.tools.server_path)),
        backend: mirror_decoder::platform_backend().context("no hardware decoder")?,
        dialer: Arc::new(TcpDialer),
        registry: DeviceRegistry::new(),
    };

    let (event_tx, event_rx) = mirror_ipc::event_channel();
    let source = mirror_engine::create_source(config.session.clone(), collaborators, event_tx);

    let events = thread::Builder::new()
        .name("event-log".into())
        .spawn(move || log_events(event_rx))?;

    let result = run(&source).await;

    source.stop().await;
    drop(source);
    if events.join().is_err() {
        error!("Event thread panicked");
    }

    result
}

/// Capture until Ctrl-C or until the source leaves the capturing state.
async fn run(source: &mirror_engine::DeviceSource) -> anyhow::Result<()> {
    source.connect().await?;
    source.start_capture().await?;

    let frames = source.frames();
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, stopping");
                return Ok(());
            }
            _ = poll.tick() => {
                // Nothing renders here; keep the frame channel drained.
                while frames.try_recv().is_ok() {}

                match source.state() {
                    SourceState::Capturing => {}
                    SourceState::Connected => {
                        info!("Server finished, capture ended");
                        return Ok(());
                    }
                    SourceState::Error(e) => return Err(e.into()),
                    other => {
                        warn!(state = other.name(), "Unexpected source state");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn log_events(events: Receiver<SourceEvent>) {
    for event in events.iter() {
        match event {
            SourceEvent::StateChanged { previous, current } => {
                info!("{} -> {}", previous.name(), current.name());
                if let Some(e) = current.error() {
                    error!("Capture error: {}", e);
                }
            }
            SourceEvent::Stats(stats) => {
                info!(
                    bytes = stats.bytes_received,
                    frames = stats.frames_delivered,
                    dropped = stats.frames_dropped,
                    "Stream stats"
                );
            }
        }
    }
}
