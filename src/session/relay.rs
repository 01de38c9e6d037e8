//! The two pumping loops of an established session.
//!
//! `socket_to_stream` moves local socket bytes into DATA frames;
//! `stream_to_socket` writes received DATA frames back to the socket. When
//! the peer signals DONE, the write side arms a short linger deadline on the
//! read side so the session drains its last bytes and ends promptly instead
//! of waiting for the socket's own EOF.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::channel::{FrameReceiver, FrameSender};
use crate::frame::{Cmd, Frame};

/// How long the socket-read side keeps draining after the peer's DONE.
const DONE_LINGER: Duration = Duration::from_millis(1400);

/// What the socket-to-stream loop hands back when it finishes.
pub(super) struct UpstreamOutcome {
    pub buf: Vec<u8>,
    pub frame: Frame,
    pub read_err: Option<std::io::Error>,
}

/// What the stream-to-socket loop hands back when it finishes.
pub(super) struct DownstreamOutcome {
    pub socket: OwnedWriteHalf,
    pub write_err: Option<std::io::Error>,
}

/// Pump local socket reads into DATA frames until EOF, a stream failure, or
/// the linger deadline. Always follows up with a best-effort DONE.
pub(super) async fn socket_to_stream(
    mut socket: OwnedReadHalf,
    mut buf: Vec<u8>,
    mut frame: Frame,
    sender: FrameSender,
    mut deadline: watch::Receiver<Option<Instant>>,
    id: i64,
    dir: &'static str,
) -> UpstreamOutcome {
    frame.id = id;
    frame.cmd = Cmd::Data;
    let mut read_err = None;

    loop {
        let current = *deadline.borrow();
        let read = match current {
            Some(at) => match tokio::time::timeout_at(at, socket.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    tracing::debug!("session {} {} linger deadline reached", id, dir);
                    break;
                }
            },
            None => tokio::select! {
                read = socket.read(&mut buf) => read,
                changed = deadline.changed() => {
                    if changed.is_ok() {
                        continue;
                    }
                    // Deadline publisher is gone; fall back to a plain read.
                    socket.read(&mut buf).await
                }
            },
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                frame.payload.clear();
                frame.payload.extend_from_slice(&buf[..n]);
                if sender.send(&frame).await.is_err() {
                    tracing::debug!("session {} {} stream gone, stopping reads", id, dir);
                    break;
                }
                tracing::trace!("session {} {} {} bytes", id, dir, n);
            }
            Err(err) => {
                read_err = Some(err);
                break;
            }
        }
    }

    // The stream may already be gone; the peer then infers the end from the
    // stream close instead.
    let _ = sender.send(&Frame::done(id)).await;

    frame.payload.clear();
    UpstreamOutcome {
        buf,
        frame,
        read_err,
    }
}

/// Pump received DATA frames into the local socket until the peer's DONE, a
/// write failure, or the stream ends.
pub(super) async fn stream_to_socket(
    mut socket: OwnedWriteHalf,
    mut receiver: FrameReceiver,
    deadline: watch::Sender<Option<Instant>>,
    id: i64,
    dir: &'static str,
) -> DownstreamOutcome {
    let mut write_err = None;

    loop {
        let frame = match receiver.recv().await {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!("session {} {} stream ended: {}", id, dir, err);
                break;
            }
        };

        match frame.cmd {
            Cmd::Data => {
                if let Err(err) = socket.write_all(&frame.payload).await {
                    write_err = Some(err);
                    break;
                }
                tracing::trace!("session {} {} {} bytes", id, dir, frame.payload.len());
            }
            Cmd::Done => {
                let _ = deadline.send(Some(Instant::now() + DONE_LINGER));
                break;
            }
            other => {
                tracing::warn!(
                    "session {} {} unexpected command {:?} mid-session",
                    id,
                    dir,
                    other
                );
                break;
            }
        }
    }

    DownstreamOutcome { socket, write_err }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MuxChannel;
    use crate::MAX_DATA_PAYLOAD;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).await.unwrap();
        let (b, _) = listener.accept().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_relay_carries_chunked_data() {
        let (mux_a, mux_b) = tokio::io::duplex(256 * 1024);
        let client = MuxChannel::client(mux_a);
        let (_server, mut incoming) = MuxChannel::server(mux_b);

        let stream = client.open_stream().unwrap();
        let (sender, _receiver) = stream.split();

        let (mut local, relayed) = socket_pair().await;
        let (read_half, _write_half) = relayed.into_split();
        let (_tx, rx) = watch::channel(None);

        let pump = tokio::spawn(socket_to_stream(
            read_half,
            vec![0u8; MAX_DATA_PAYLOAD],
            Frame::default(),
            sender,
            rx,
            3,
            "~>",
        ));

        // Larger than one frame, so it must be split and reassembled.
        let payload: Vec<u8> = (0..MAX_DATA_PAYLOAD + 100).map(|i| i as u8).collect();
        local.write_all(&payload).await.unwrap();
        local.shutdown().await.unwrap();

        let mut remote = incoming.recv().await.unwrap();
        let mut collected = Vec::new();
        loop {
            let frame = remote.recv().await.unwrap();
            match frame.cmd {
                Cmd::Data => collected.extend_from_slice(&frame.payload),
                Cmd::Done => break,
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(frame.id, 3);
            assert!(frame.payload.len() <= MAX_DATA_PAYLOAD);
        }
        assert_eq!(collected, payload);

        let outcome = pump.await.unwrap();
        assert!(outcome.read_err.is_none());
    }

    #[tokio::test]
    async fn test_done_arms_linger_deadline() {
        let (mux_a, mux_b) = tokio::io::duplex(64 * 1024);
        let client = MuxChannel::client(mux_a);
        let (_server, mut incoming) = MuxChannel::server(mux_b);

        let stream = client.open_stream().unwrap();
        stream
            .send(&Frame {
                id: 4,
                cmd: Cmd::Data,
                payload: b"tail".to_vec(),
            })
            .await
            .unwrap();
        stream.send(&Frame::done(4)).await.unwrap();

        let remote = incoming.recv().await.unwrap();
        let (_remote_tx, remote_rx) = remote.split();

        let (local, relayed) = socket_pair().await;
        let (_read_half, write_half) = relayed.into_split();
        let (tx, rx) = watch::channel(None);

        let downstream = tokio::spawn(stream_to_socket(write_half, remote_rx, tx, 4, "<~"));
        let outcome = downstream.await.unwrap();
        assert!(outcome.write_err.is_none());
        assert!(rx.borrow().is_some());

        // The local peer keeps its socket open; the armed deadline must end
        // a read loop that would otherwise block forever.
        let (read_half, _write_half) = local.into_split();
        let (mux_c, _mux_d) = tokio::io::duplex(1024);
        let side = MuxChannel::client(mux_c);
        let (sender, _r) = side.open_stream().unwrap().split();
        let upstream = tokio::spawn(socket_to_stream(
            read_half,
            vec![0u8; MAX_DATA_PAYLOAD],
            Frame::default(),
            sender,
            rx,
            4,
            "~>",
        ));
        let outcome = tokio::time::timeout(Duration::from_secs(5), upstream)
            .await
            .expect("read loop must exit on the linger deadline")
            .unwrap();
        assert!(outcome.read_err.is_none());
    }
}
