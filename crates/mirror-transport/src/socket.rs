//! Video socket: connect, accept and the cancellable read loop.

use std::future::Future;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::{ConnectionState, RetryPolicy};
use crate::error::TransportError;
use crate::{TransportResult, READ_BUFFER_SIZE};

/// Opens outbound TCP connections.
///
/// Abstracted so retry behavior can be exercised without a device.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// Dial `addr`, retrying with a fixed delay.
///
/// Returns the stream and the number of attempts it took.
pub async fn connect_with_retry<D>(
    dialer: &D,
    addr: SocketAddr,
    policy: &RetryPolicy,
) -> TransportResult<(TcpStream, u32)>
where
    D: Dialer + ?Sized,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        trace!(
            status = %ConnectionState::Connecting { attempt }.message(),
            %addr,
            "Dialing video socket"
        );

        match dialer.dial(addr).await {
            Ok(stream) => {
                debug!(%addr, attempt, "Video socket connected");
                return Ok((stream, attempt));
            }
            Err(e) => {
                if !policy.should_retry(attempt) {
                    warn!(%addr, attempt, "Giving up on video socket: {}", e);
                    return Err(TransportError::ConnectionFailed {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                debug!("Connect attempt {} failed: {}", attempt, e);
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// How a read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The peer closed the stream.
    Closed,
    /// The loop was cancelled.
    Cancelled,
    /// A read failed.
    Failed(String),
}

/// Listener the device dials into when the tunnel runs in reverse mode.
#[derive(Debug)]
pub struct VideoListener {
    listener: TcpListener,
    port: u16,
}

impl VideoListener {
    /// Bind on the loopback interface. Port 0 picks a free port.
    pub async fn bind(port: u16) -> TransportResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|e| TransportError::ListenFailed {
                port,
                reason: e.to_string(),
            })?;
        let port = listener.local_addr()?.port();
        debug!(port, "Video listener bound");
        Ok(Self { listener, port })
    }

    /// Port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the device to connect.
    #[instrument(name = "video_accept", skip(self), fields(port = self.port))]
    pub async fn accept(&self, timeout: Duration) -> TransportResult<VideoSocket> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!(%peer, "Device connected to video listener");
                Ok(VideoSocket::from_stream(stream))
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

/// The connected video socket.
///
/// The stream moves into the read loop once [`VideoSocket::spawn_read_loop`]
/// is called; the returned handle controls it from then on.
#[derive(Debug)]
pub struct VideoSocket {
    stream: Option<TcpStream>,
    state: ConnectionState,
}

impl VideoSocket {
    /// Dial the forwarded local port with the given retry policy.
    #[instrument(name = "video_connect", skip(dialer, policy))]
    pub async fn connect<D>(dialer: &D, port: u16, policy: &RetryPolicy) -> TransportResult<Self>
    where
        D: Dialer + ?Sized,
    {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let (stream, attempts) = connect_with_retry(dialer, addr, policy).await?;
        info!(port, attempts, "Video socket connected");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Self {
            stream: Some(stream),
            state: ConnectionState::Connected,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Start reading on a background task.
    ///
    /// `on_chunk` runs for every non-empty read, in order, and the next read
    /// waits for its future. Cancellation interrupts that wait and drops the
    /// chunk. `on_end` runs once with the outcome unless the task is aborted
    /// after a missed grace period. Must be called from within a tokio
    /// runtime.
    pub fn spawn_read_loop<F, Fut, E>(
        &mut self,
        cancel: CancellationToken,
        mut on_chunk: F,
        on_end: E,
    ) -> TransportResult<ReadLoopHandle>
    where
        F: FnMut(Bytes) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        E: FnOnce(ReadOutcome) + Send + 'static,
    {
        let stream = self.stream.take().ok_or(TransportError::NotConnected)?;

        // Keep a second handle on the socket so the read side can be shut
        // down while the task is parked in a read.
        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        let mut stream = TcpStream::from_std(std_stream)?;

        let bytes_read = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&bytes_read);
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

            let outcome = loop {
                buf.reserve(READ_BUFFER_SIZE);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break ReadOutcome::Cancelled,
                    result = stream.read_buf(&mut buf) => match result {
                        Ok(0) if token.is_cancelled() => break ReadOutcome::Cancelled,
                        Ok(0) => break ReadOutcome::Closed,
                        Ok(n) => {
                            counter.fetch_add(n as u64, Ordering::Relaxed);
                            let delivered = on_chunk(buf.split().freeze());
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => break ReadOutcome::Cancelled,
                                _ = delivered => {}
                            }
                        }
                        Err(_) if token.is_cancelled() => break ReadOutcome::Cancelled,
                        Err(e) => break ReadOutcome::Failed(e.to_string()),
                    },
                }
            };

            debug!(?outcome, "Read loop finished");
            on_end(outcome.clone());
            outcome
        });

        self.state = ConnectionState::Streaming;

        Ok(ReadLoopHandle {
            cancel,
            control: Some(control),
            task: Some(task),
            bytes_read,
        })
    }
}

/// Control handle for a running read loop.
#[derive(Debug)]
pub struct ReadLoopHandle {
    cancel: CancellationToken,
    control: Option<std::net::TcpStream>,
    task: Option<JoinHandle<ReadOutcome>>,
    bytes_read: Arc<AtomicU64>,
}

impl ReadLoopHandle {
    /// Signal the loop to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Half-close the read side so a blocked read returns.
    pub fn shutdown_read(&self) {
        if let Some(control) = &self.control {
            if let Err(e) = control.shutdown(Shutdown::Read) {
                // Already closed by the peer.
                debug!("Read shutdown: {}", e);
            }
        }
    }

    /// Wait up to `grace` for the loop to exit.
    ///
    /// Returns the outcome, or `None` if the loop had to be aborted or was
    /// already joined.
    pub async fn join(&mut self, grace: Duration) -> Option<ReadOutcome> {
        let mut task = self.task.take()?;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!("Read loop task failed: {}", e);
                None
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Read loop did not exit, aborting");
                task.abort();
                None
            }
        }
    }

    /// Close the socket.
    pub fn close(&mut self) {
        if let Some(control) = self.control.take() {
            let _ = control.shutdown(Shutdown::Both);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether the loop task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Total bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

impl Drop for ReadLoopHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.close();
    }
}
