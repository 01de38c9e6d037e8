//! Client-side ownership of the shared channel, with single-flight repair.
//!
//! Every local session asks the factory for a fresh multiplexed stream. When
//! the channel is broken, exactly one caller per failure epoch performs the
//! redial; the rest observe the outcome through a generation counter and
//! either reuse the repaired channel or fail alongside the dialer.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::RwLock;

use crate::channel::{FrameStream, MuxChannel};
use crate::error::{Error, Result};
use crate::tls::ClientTls;

struct FactoryState {
    /// Advances once per completed dial attempt, success or failure.
    generation: u64,
    channel: Option<Arc<MuxChannel>>,
}

/// Produces multiplexed streams over one shared client connection.
pub struct ChannelFactory {
    server_addr: String,
    tls: Option<ClientTls>,
    inner: RwLock<FactoryState>,
}

impl ChannelFactory {
    /// Create a factory for the given server address. No connection is made
    /// until [`connect`](Self::connect) or [`obtain_stream`](Self::obtain_stream).
    pub fn new(server_addr: String, tls: Option<ClientTls>) -> Self {
        Self {
            server_addr,
            tls,
            inner: RwLock::new(FactoryState {
                generation: 0,
                channel: None,
            }),
        }
    }

    /// Establish the initial channel eagerly, so a broken server address
    /// fails at startup rather than on the first session.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.inner.write().await;
        let channel = self.dial().await?;
        state.generation += 1;
        state.channel = Some(channel);
        tracing::info!("connected to proxy server at {}", self.server_addr);
        Ok(())
    }

    /// Obtain a fresh stream, redialing the channel if it has failed.
    ///
    /// Concurrent callers that observed the same broken channel share a
    /// single redial: whoever reaches the write lock first with an unchanged
    /// generation dials, and the rest see the advanced counter and use (or
    /// report) that attempt's outcome.
    pub async fn obtain_stream(&self) -> Result<FrameStream> {
        let seen = {
            let state = self.inner.read().await;
            if let Some(channel) = &state.channel {
                if let Ok(stream) = channel.open_stream() {
                    return Ok(stream);
                }
            }
            state.generation
        };

        let mut state = self.inner.write().await;
        if state.generation == seen {
            state.generation += 1;
            match self.dial().await {
                Ok(channel) => {
                    tracing::info!("reconnected to proxy server at {}", self.server_addr);
                    state.channel = Some(channel);
                }
                Err(err) => {
                    state.channel = None;
                    return Err(err);
                }
            }
        }

        match &state.channel {
            Some(channel) => channel.open_stream(),
            None => Err(Error::dial("proxy channel unavailable")),
        }
    }

    async fn dial(&self) -> Result<Arc<MuxChannel>> {
        let socket = TcpStream::connect(&self.server_addr)
            .await
            .map_err(|e| Error::dial(format!("{}: {}", self.server_addr, e)))?;
        socket
            .set_nodelay(true)
            .map_err(|e| Error::dial(e.to_string()))?;

        match &self.tls {
            Some(tls) => {
                let stream = tls.connect(socket).await?;
                Ok(MuxChannel::client(stream))
            }
            None => Ok(MuxChannel::client(socket)),
        }
    }

    #[cfg(test)]
    async fn generation(&self) -> u64 {
        self.inner.read().await.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts connections and parks them so the channel stays alive.
    fn accept_and_hold(listener: TcpListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
    }

    #[tokio::test]
    async fn test_concurrent_streams_share_one_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        accept_and_hold(listener);

        let factory = Arc::new(ChannelFactory::new(addr.to_string(), None));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let factory = Arc::clone(&factory);
            tasks.push(tokio::spawn(
                async move { factory.obtain_stream().await },
            ));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        // All eight streams came from a single dial.
        assert_eq!(factory.generation().await, 1);
    }

    #[tokio::test]
    async fn test_failed_dial_advances_generation() {
        // Bind then drop: the port is very likely refused afterwards.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let factory = ChannelFactory::new(addr.to_string(), None);
        assert!(factory.obtain_stream().await.is_err());
        assert_eq!(factory.generation().await, 1);
        assert!(factory.obtain_stream().await.is_err());
        assert_eq!(factory.generation().await, 2);
    }

    #[tokio::test]
    async fn test_recovers_after_server_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let factory = ChannelFactory::new(addr.to_string(), None);
        assert!(factory.obtain_stream().await.is_err());

        let listener = TcpListener::bind(addr).await.unwrap();
        accept_and_hold(listener);
        assert!(factory.obtain_stream().await.is_ok());
    }
}
