//! Server entry point: accepts channel connections and serves their streams.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::channel::MuxChannel;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::session::pool::SessionPool;
use crate::session::serve_inbound_session;
use crate::tls::ServerTls;

/// The egress side of the proxy: each accepted connection becomes a
/// multiplexed channel, each stream on it a session to some target.
pub struct ProxyServer {
    config: ServerConfig,
    tls: Option<ServerTls>,
    pool: Arc<SessionPool>,
    /// Session ids start at 1; 0 is reserved for the handshake exchange.
    next_session_id: Arc<AtomicI64>,
}

impl ProxyServer {
    /// Build the server from validated configuration.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let tls = if config.tls {
            let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) else {
                return Err(Error::config("tls requires cert_file and key_file"));
            };
            Some(ServerTls::new(cert, key)?)
        } else {
            None
        };

        Ok(Self {
            config,
            tls,
            pool: SessionPool::new(),
            next_session_id: Arc::new(AtomicI64::new(1)),
        })
    }

    /// Bind the channel listener and serve until the process is stopped.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!(
            "listening on {} (tls: {})",
            self.config.listen_addr,
            self.tls.is_some()
        );
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            tracing::info!("channel connection from {}", peer);
            if let Err(err) = socket.set_nodelay(true) {
                tracing::warn!("set_nodelay failed for {}: {}", peer, err);
            }

            let pool = Arc::clone(&self.pool);
            let next_id = Arc::clone(&self.next_session_id);
            match &self.tls {
                Some(tls) => {
                    let stream = match tls.accept(socket).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            tracing::warn!("TLS handshake with {} failed: {}", peer, err);
                            continue;
                        }
                    };
                    tokio::spawn(serve_channel(stream, pool, next_id));
                }
                None => {
                    tokio::spawn(serve_channel(socket, pool, next_id));
                }
            }
        }
    }
}

/// Serve one channel: accept implicitly opened streams and run a session for
/// each until the connection is gone.
async fn serve_channel<S>(io: S, pool: Arc<SessionPool>, next_id: Arc<AtomicI64>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (_channel, mut incoming) = MuxChannel::server(io);

    while let Some(stream) = incoming.recv().await {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(err) = serve_inbound_session(id, stream, &pool).await {
                tracing::debug!("session {} failed: {}", id, err);
            }
        });
    }
    tracing::info!("channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_requires_identity_files() {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            tls: true,
            cert_file: None,
            key_file: None,
            verbose: false,
        };
        assert!(matches!(ProxyServer::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_plain_config_builds() {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            tls: false,
            cert_file: None,
            key_file: None,
            verbose: false,
        };
        assert!(ProxyServer::new(config).is_ok());
    }
}
