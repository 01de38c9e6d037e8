//! Session lifecycle: handshake, bidirectional relay, pooled state.
//!
//! A session ties one local TCP socket to one multiplexed stream. On the
//! client side the socket is the accepted SOCKS connection and the stream is
//! obtained from the channel factory; on the server side the stream arrives
//! from the mux and the socket is dialed to the requested target.

pub mod pool;

mod relay;

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::channel::{ChannelFactory, FrameStream};
use crate::error::{Error, Result};
use crate::frame::{Cmd, Frame};
use crate::session::pool::{PooledSession, SessionPool};
use crate::socks::parse_target_addr;

/// Run one client-side session: handshake the target over a fresh stream,
/// then relay until both directions finish.
pub async fn serve_outbound_session(
    socket: TcpStream,
    target: &[u8],
    factory: &ChannelFactory,
    pool: &Arc<SessionPool>,
) -> Result<()> {
    let stream = factory.obtain_stream().await?;

    let mut session = pool.acquire();
    session.socket = Some(socket);

    let stream = connect_handshake(stream, &mut session, target).await?;
    tracing::debug!("session {} established", session.id);

    run_relay(&mut session, stream, "~>", "<~").await;
    log_session_end(&session);
    Ok(())
}

/// Run one server-side session: accept the CONNECT handshake on the incoming
/// stream, dial the target, then relay until both directions finish.
pub async fn serve_inbound_session(
    id: i64,
    stream: FrameStream,
    pool: &Arc<SessionPool>,
) -> Result<()> {
    let mut session = pool.acquire();
    session.id = id;
    session.frame.id = id;

    let stream = accept_handshake(stream, &mut session).await?;

    run_relay(&mut session, stream, "<~", "~>").await;
    log_session_end(&session);
    Ok(())
}

/// Client half of the handshake: send CONNECT, require CONNECTED, adopt the
/// id the server assigned.
async fn connect_handshake(
    mut stream: FrameStream,
    session: &mut PooledSession,
    target: &[u8],
) -> Result<FrameStream> {
    stream.send(&Frame::connect(target)).await?;

    let reply = stream.recv().await?;
    if reply.cmd != Cmd::Connected || reply.id == 0 {
        return Err(Error::UnexpectedCommand {
            cmd: reply.cmd as u8,
            id: reply.id,
        });
    }

    session.id = reply.id;
    session.frame.id = reply.id;
    Ok(stream)
}

/// Server half of the handshake: require CONNECT, dial the target it names,
/// acknowledge with CONNECTED under this session's id.
async fn accept_handshake(
    mut stream: FrameStream,
    session: &mut PooledSession,
) -> Result<FrameStream> {
    let mut request = stream.recv().await?;
    if request.cmd != Cmd::Connect {
        return Err(Error::UnexpectedCommand {
            cmd: request.cmd as u8,
            id: request.id,
        });
    }

    let (host, port) = parse_target_addr(&request.payload)?;
    let target = TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
        tracing::debug!("session {} target {}:{} unreachable: {}", session.id, host, port, e);
        Error::TargetDial(e)
    })?;
    target.set_nodelay(true).map_err(Error::TargetDial)?;
    tracing::debug!("session {} connected to {}:{}", session.id, host, port);

    session.socket = Some(target);

    // Echo the request frame back as the acknowledgement.
    request.cmd = Cmd::Connected;
    request.id = session.id;
    stream.send(&request).await?;
    Ok(stream)
}

/// Relay both directions to completion, then repopulate the pooled state
/// with the reusable pieces and the terminal status of each loop.
async fn run_relay(
    session: &mut PooledSession,
    stream: FrameStream,
    up: &'static str,
    down: &'static str,
) {
    let socket = session
        .socket
        .take()
        .expect("session socket set before relay");
    let (read_half, write_half) = socket.into_split();
    let (sender, receiver) = stream.split();

    let buf = std::mem::take(&mut session.buf);
    let frame = std::mem::take(&mut session.frame);
    let id = session.id;

    let (deadline_tx, deadline_rx) = watch::channel(None);
    let upstream = tokio::spawn(relay::socket_to_stream(
        read_half,
        buf,
        frame,
        sender,
        deadline_rx,
        id,
        up,
    ));
    let downstream = tokio::spawn(relay::stream_to_socket(
        write_half,
        receiver,
        deadline_tx,
        id,
        down,
    ));

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    // The tasks only finish by returning their outcome.
    let upstream = upstream.expect("relay task panicked");
    let downstream = downstream.expect("relay task panicked");

    session.buf = upstream.buf;
    session.frame = upstream.frame;
    session.read_err = upstream.read_err;
    session.write_err = downstream.write_err;
    session.socket = None;
    drop(downstream.socket);
}

fn log_session_end(session: &PooledSession) {
    match (&session.read_err, &session.write_err) {
        (None, None) => tracing::debug!("session {} finished", session.id),
        (read, write) => tracing::debug!(
            "session {} finished (read: {:?}, write: {:?})",
            session.id,
            read,
            write
        ),
    }
}
