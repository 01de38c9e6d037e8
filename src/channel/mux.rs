//! Lightweight stream multiplexing over a single byte-stream connection.
//!
//! Each envelope has a 9-byte header: kind(1) + stream_id(4) + body_len(4).
//! A kind-0 envelope carries one encoded [`Frame`]; a kind-1 envelope closes
//! the stream. Stream ids are allocated by the client side; the server side
//! treats a frame for an unknown id as an implicit stream open. Ordering is
//! guaranteed within one stream only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::frame::{Frame, FRAME_HEADER_SIZE};
use crate::MAX_DATA_PAYLOAD;

/// Envelope header size.
const ENVELOPE_HEADER_SIZE: usize = 9;

/// Largest acceptable envelope body: one maximal DATA frame.
const MAX_ENVELOPE_BODY: usize = MAX_DATA_PAYLOAD + FRAME_HEADER_SIZE;

const KIND_FRAME: u8 = 0;
const KIND_CLOSE: u8 = 1;

/// Depth of the shared outbound queue feeding the connection writer.
const OUTBOUND_QUEUE: usize = 256;

/// Depth of each per-stream inbound queue.
const STREAM_QUEUE: usize = 64;

struct Envelope {
    kind: u8,
    stream_id: u32,
    body: Bytes,
}

struct ChannelCore {
    /// Taken on close so the writer task's queue drains to `None` and exits.
    out_tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    closed: AtomicBool,
}

impl ChannelCore {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.out_tx.lock().take();
        // Dropping the senders ends every stream's pending receive.
        self.streams.lock().clear();
    }

    fn outbound(&self) -> Option<mpsc::Sender<Envelope>> {
        self.out_tx.lock().clone()
    }
}

/// A multiplexed channel over one connection.
///
/// The client role opens streams with [`open_stream`](Self::open_stream);
/// the server role receives implicitly opened streams from the receiver
/// returned by [`server`](Self::server).
pub struct MuxChannel {
    core: Arc<ChannelCore>,
    next_stream_id: AtomicU32,
}

impl MuxChannel {
    /// Wrap a dialed connection in the client role.
    pub fn client<S>(io: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self::start(io, None))
    }

    /// Wrap an accepted connection in the server role. Streams opened by the
    /// peer arrive on the returned receiver; it yields `None` once the
    /// connection is gone.
    pub fn server<S>(io: S) -> (Arc<Self>, mpsc::Receiver<FrameStream>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (accept_tx, accept_rx) = mpsc::channel(STREAM_QUEUE);
        (Arc::new(Self::start(io, Some(accept_tx))), accept_rx)
    }

    fn start<S>(io: S, accept_tx: Option<mpsc::Sender<FrameStream>>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let core = Arc::new(ChannelCore {
            out_tx: Mutex::new(Some(out_tx)),
            streams: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(read_loop(read_half, Arc::clone(&core), accept_tx));
        tokio::spawn(write_loop(write_half, out_rx, Arc::clone(&core)));

        Self {
            core,
            next_stream_id: AtomicU32::new(1),
        }
    }

    /// Open a new multiplexed stream (client role).
    ///
    /// This is a local operation; the peer learns about the stream from its
    /// first frame. Fails once the underlying connection is gone.
    pub fn open_stream(&self) -> Result<FrameStream> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.core.streams.lock().insert(stream_id, tx);
        Ok(FrameStream::new(stream_id, Arc::clone(&self.core), rx))
    }

    /// Whether the underlying connection has failed or closed.
    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::Acquire)
    }
}

async fn read_loop<R>(
    mut reader: R,
    core: Arc<ChannelCore>,
    accept_tx: Option<mpsc::Sender<FrameStream>>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; ENVELOPE_HEADER_SIZE];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let kind = header[0];
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if len > MAX_ENVELOPE_BODY {
            tracing::warn!("oversized envelope ({} bytes) on stream {}", len, stream_id);
            break;
        }
        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }

        match kind {
            KIND_FRAME => {
                let known = core.streams.lock().get(&stream_id).cloned();
                let tx = match known {
                    Some(tx) => tx,
                    None => {
                        // Client role: a frame for a stream we already
                        // dropped; the peer's close is still in flight.
                        let Some(accept) = &accept_tx else { continue };

                        // Server role: implicit stream open.
                        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                        core.streams.lock().insert(stream_id, tx.clone());
                        let stream = FrameStream::new(stream_id, Arc::clone(&core), rx);
                        if accept.send(stream).await.is_err() {
                            break;
                        }
                        tx
                    }
                };
                // A failed send means the stream's session already ended.
                let _ = tx.send(Bytes::from(body)).await;
            }
            KIND_CLOSE => {
                core.streams.lock().remove(&stream_id);
            }
            other => {
                tracing::warn!("invalid envelope kind {} on stream {}", other, stream_id);
                break;
            }
        }
    }
    core.mark_closed();
}

async fn write_loop<W>(mut writer: W, mut out_rx: mpsc::Receiver<Envelope>, core: Arc<ChannelCore>)
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; ENVELOPE_HEADER_SIZE];
    while let Some(envelope) = out_rx.recv().await {
        header[0] = envelope.kind;
        header[1..5].copy_from_slice(&envelope.stream_id.to_be_bytes());
        header[5..9].copy_from_slice(&(envelope.body.len() as u32).to_be_bytes());
        if writer.write_all(&header).await.is_err()
            || writer.write_all(&envelope.body).await.is_err()
            || writer.flush().await.is_err()
        {
            break;
        }
    }
    core.mark_closed();
}

/// Shared half-state of one stream; removes the stream's routing entry and
/// notifies the peer when the last handle drops.
struct StreamGuard {
    stream_id: u32,
    core: Arc<ChannelCore>,
}

impl StreamGuard {
    async fn send(&self, frame: &Frame) -> Result<()> {
        let Some(out) = self.core.outbound() else {
            return Err(Error::ChannelClosed);
        };
        out.send(Envelope {
            kind: KIND_FRAME,
            stream_id: self.stream_id,
            body: frame.encode(),
        })
        .await
        .map_err(|_| Error::ChannelClosed)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.core.streams.lock().remove(&self.stream_id);
        // Best-effort close notification so the peer's pending receive
        // unblocks; a full outbound queue or dead channel loses nothing.
        if let Some(out) = self.core.outbound() {
            let _ = out.try_send(Envelope {
                kind: KIND_CLOSE,
                stream_id: self.stream_id,
                body: Bytes::new(),
            });
        }
    }
}

/// One multiplexed, ordered, bidirectional sequence of frames for a session.
pub struct FrameStream {
    guard: Arc<StreamGuard>,
    rx: mpsc::Receiver<Bytes>,
}

impl FrameStream {
    fn new(stream_id: u32, core: Arc<ChannelCore>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            guard: Arc::new(StreamGuard { stream_id, core }),
            rx,
        }
    }

    /// Send a frame on this stream.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.guard.send(frame).await
    }

    /// Receive the next frame on this stream.
    pub async fn recv(&mut self) -> Result<Frame> {
        match self.rx.recv().await {
            Some(body) => Frame::decode(&body),
            None => Err(Error::StreamClosed),
        }
    }

    /// Split into independently owned send and receive halves for the two
    /// relay loops.
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        let FrameStream { guard, rx } = self;
        (
            FrameSender {
                guard: Arc::clone(&guard),
            },
            FrameReceiver { rx, _guard: guard },
        )
    }
}

/// Sending half of a [`FrameStream`].
pub struct FrameSender {
    guard: Arc<StreamGuard>,
}

impl FrameSender {
    /// Send a frame on this stream.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.guard.send(frame).await
    }
}

/// Receiving half of a [`FrameStream`].
pub struct FrameReceiver {
    rx: mpsc::Receiver<Bytes>,
    _guard: Arc<StreamGuard>,
}

impl FrameReceiver {
    /// Receive the next frame on this stream.
    pub async fn recv(&mut self) -> Result<Frame> {
        match self.rx.recv().await {
            Some(body) => Frame::decode(&body),
            None => Err(Error::StreamClosed),
        }
    }
}
