//! Serial decode queue.
//!
//! One worker thread owns the demuxer and the decode session, so parameter
//! set tracking, session (re)initialization and frame submission never run
//! concurrently and frames are submitted in stream order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use mirror_ipc::VideoCodec;
use mirror_transport::Demuxer;

use crate::error::DecoderError;
use crate::session::{DecodeCounters, DecodeSession, DecodeState};
use crate::{DecoderBackend, DecoderEvent, DecoderResult};

/// Raw chunks buffered between the socket and the decode queue.
///
/// A full queue suspends the sender, pushing back on the socket.
pub const CHUNK_CHANNEL_CAPACITY: usize = 256;

enum QueueCommand {
    Chunk(Bytes),
    Reset,
    Shutdown,
}

/// Cloneable handle for feeding raw stream bytes into the queue.
#[derive(Clone)]
pub struct ChunkSender(mpsc::Sender<QueueCommand>);

impl ChunkSender {
    /// Queue a chunk, waiting while the queue is full. Returns false once
    /// the queue has shut down.
    ///
    /// Dropping the future before it completes drops the chunk.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.0.send(QueueCommand::Chunk(chunk)).await.is_ok()
    }
}

/// Handle on the decode worker thread.
pub struct DecodeQueue {
    sender: mpsc::Sender<QueueCommand>,
    thread: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
    state: Arc<RwLock<DecodeState>>,
    counters: Arc<DecodeCounters>,
}

impl DecodeQueue {
    /// Start the worker. Decoded frames go to `output`.
    pub fn spawn(
        codec: VideoCodec,
        backend: Arc<dyn DecoderBackend>,
        output: Sender<DecoderEvent>,
    ) -> DecoderResult<Self> {
        let (sender, receiver) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));

        let session = DecodeSession::new(codec, backend, output);
        let state = session.state_handle();
        let counters = session.counters();

        let stop = Arc::clone(&stopping);
        let thread = thread::Builder::new()
            .name("decode-queue".into())
            .spawn(move || run_queue(codec, session, receiver, stop))
            .map_err(|e| DecoderError::Queue(e.to_string()))?;

        info!(%codec, "Decode queue started");

        Ok(Self {
            sender,
            thread: Some(thread),
            stopping,
            state,
            counters,
        })
    }

    /// Handle for the transport read loop.
    pub fn chunk_sender(&self) -> ChunkSender {
        ChunkSender(self.sender.clone())
    }

    /// Discard partial stream data before a new stream starts.
    ///
    /// The decoder session is kept; it reopens only if the new stream's
    /// parameter sets differ.
    pub async fn reset(&self) {
        let _ = self.sender.send(QueueCommand::Reset).await;
    }

    pub fn state(&self) -> DecodeState {
        *self.state.read()
    }

    pub fn counters(&self) -> Arc<DecodeCounters> {
        Arc::clone(&self.counters)
    }

    /// Stop the worker and invalidate the decoder. Idempotent.
    ///
    /// Queued chunks are discarded and the unit being decoded is the last
    /// one submitted. Blocks until the worker exits; call it off the async
    /// runtime.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        // A full channel means the worker is busy and sees the flag when it
        // takes its next command.
        let _ = self.sender.try_send(QueueCommand::Shutdown);
        if thread.join().is_err() {
            tracing::error!("Decode queue thread panicked");
        }
        info!("Decode queue stopped");
    }
}

impl Drop for DecodeQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_queue(
    codec: VideoCodec,
    mut session: DecodeSession,
    mut receiver: mpsc::Receiver<QueueCommand>,
    stopping: Arc<AtomicBool>,
) {
    let mut demuxer = Demuxer::new(codec);

    while let Some(command) = receiver.blocking_recv() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        match command {
            QueueCommand::Chunk(data) => {
                demuxer.parse_each(&data, |unit, cache| {
                    if !stopping.load(Ordering::Relaxed) {
                        session.submit(&unit, cache);
                    }
                });
            }
            QueueCommand::Reset => {
                debug!(
                    pending = demuxer.pending_len(),
                    "Resetting demuxer for new stream"
                );
                demuxer.reset();
            }
            QueueCommand::Shutdown => break,
        }
    }

    // Senders waiting on a full channel fail instead of hanging.
    receiver.close();
    session.invalidate();
}
