//! Client entry point: the local SOCKS listener feeding the shared channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::channel::ChannelFactory;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::session::pool::SessionPool;
use crate::session::serve_outbound_session;
use crate::socks::{self, TargetRequest};
use crate::tls::ClientTls;

/// How often the UDP association hold loop wakes to poll the TCP side.
const UDP_HOLD_POLL: Duration = Duration::from_secs(30);

/// The client side of the proxy: accepts local SOCKS connections and relays
/// each over a stream from the shared channel.
pub struct ProxyClient {
    config: ClientConfig,
    factory: Arc<ChannelFactory>,
    pool: Arc<SessionPool>,
}

impl ProxyClient {
    /// Build the client from validated configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let tls = if config.tls {
            Some(ClientTls::new(
                config.ca_file.as_deref(),
                config.tls_server_name(),
            )?)
        } else {
            None
        };
        let factory = Arc::new(ChannelFactory::new(config.server_addr.clone(), tls));

        Ok(Self {
            config,
            factory,
            pool: SessionPool::new(),
        })
    }

    /// Connect the shared channel, bind the SOCKS listener, and serve until
    /// the process is stopped.
    pub async fn run(&self) -> Result<()> {
        // A bad server address should fail at startup, not on first use.
        self.factory.connect().await?;

        let listener = TcpListener::bind(&self.config.socks_addr).await?;
        tracing::info!("SOCKS5 listening on {}", self.config.socks_addr);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            tracing::debug!("local connection from {}", peer);

            let factory = Arc::clone(&self.factory);
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                if let Err(err) = handle_local(socket, &factory, &pool).await {
                    tracing::debug!("local connection from {} ended: {}", peer, err);
                }
            });
        }
    }
}

async fn handle_local(
    mut socket: TcpStream,
    factory: &ChannelFactory,
    pool: &Arc<SessionPool>,
) -> Result<()> {
    match socks::negotiate(&mut socket).await? {
        TargetRequest::Connect(target) => {
            serve_outbound_session(socket, &target, factory, pool).await
        }
        TargetRequest::UdpAssociate { socket: udp } => hold_udp_association(socket, udp).await,
    }
}

/// Keep a UDP association's TCP connection open until the client is done
/// with it. RFC 1928 scopes the association to the TCP connection's
/// lifetime, so any read outcome here, data, EOF or error, ends it and
/// releases the UDP socket.
async fn hold_udp_association(mut socket: TcpStream, udp: UdpSocket) -> Result<()> {
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(UDP_HOLD_POLL, socket.read(&mut buf)).await {
            Err(_) => continue,
            Ok(_) => break,
        }
    }
    drop(udp);
    tracing::debug!("UDP association released");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::ProxyServer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_target() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Full stack over plain TCP: SOCKS client -> proxy client -> channel ->
    /// proxy server -> echo target.
    #[tokio::test]
    async fn test_end_to_end_relay() {
        let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_listener.local_addr().unwrap();
        let server = ProxyServer::new(ServerConfig {
            listen_addr: server_addr.to_string(),
            tls: false,
            cert_file: None,
            key_file: None,
            verbose: false,
        })
        .unwrap();
        tokio::spawn(async move {
            let _ = server.serve(server_listener).await;
        });

        let socks_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_addr = socks_listener.local_addr().unwrap();
        let client = ProxyClient::new(ClientConfig {
            socks_addr: socks_addr.to_string(),
            server_addr: server_addr.to_string(),
            tls: false,
            ca_file: None,
            server_name: None,
            verbose: false,
        })
        .unwrap();
        tokio::spawn(async move {
            let _ = client.serve(socks_listener).await;
        });

        let target = echo_target().await;

        // Speak SOCKS5 like a real client.
        let mut conn = TcpStream::connect(socks_addr).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        match target.ip() {
            std::net::IpAddr::V4(ip) => request.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(_) => unreachable!(),
        }
        request.extend_from_slice(&target.port().to_be_bytes());
        conn.write_all(&request).await.unwrap();
        let mut ok = [0u8; 10];
        conn.read_exact(&mut ok).await.unwrap();
        assert_eq!(ok[1], 0x00);

        // Relay fidelity through the whole stack.
        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        conn.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        conn.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        // Second connection reuses the channel and the pooled session state.
        let mut conn2 = TcpStream::connect(socks_addr).await.unwrap();
        conn2.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        conn2.read_exact(&mut reply).await.unwrap();
        conn2.write_all(&request).await.unwrap();
        conn2.read_exact(&mut ok).await.unwrap();
        assert_eq!(ok[1], 0x00);
        conn2.write_all(b"second session").await.unwrap();
        let mut small = [0u8; 14];
        conn2.read_exact(&mut small).await.unwrap();
        assert_eq!(&small, b"second session");
    }
}
