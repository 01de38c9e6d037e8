//! Reusable session state, pooled to avoid reallocating relay buffers.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::frame::Frame;
use crate::MAX_DATA_PAYLOAD;

/// Pooled objects kept beyond this count are dropped instead.
const MAX_POOLED: usize = 64;

/// Per-session working state: the local socket, the read buffer and the
/// scratch frame both relay loops reuse, and the terminal status of each
/// direction for end-of-session logging.
pub struct SessionState {
    /// Session id, assigned during the handshake (0 while idle).
    pub id: i64,
    /// The local TCP socket being relayed; taken by the relay while running.
    pub socket: Option<TcpStream>,
    /// Read buffer for the socket-to-stream direction.
    pub buf: Vec<u8>,
    /// Scratch frame reused for every outbound DATA frame.
    pub frame: Frame,
    /// Error that ended the socket-read loop, if it was not a clean EOF.
    pub read_err: Option<std::io::Error>,
    /// Error that ended the socket-write loop, if any.
    pub write_err: Option<std::io::Error>,
}

impl SessionState {
    fn new() -> Box<Self> {
        Box::new(Self {
            id: 0,
            socket: None,
            buf: vec![0u8; MAX_DATA_PAYLOAD],
            frame: Frame::default(),
            read_err: None,
            write_err: None,
        })
    }

    /// Scrub session-specific state so the object is safe to hand to the
    /// next session. The buffer keeps its allocation.
    fn reset(&mut self) {
        self.id = 0;
        self.socket = None;
        self.read_err = None;
        self.write_err = None;
        if self.buf.len() != MAX_DATA_PAYLOAD {
            self.buf.resize(MAX_DATA_PAYLOAD, 0);
        }
        self.frame.id = 0;
        self.frame.cmd = crate::frame::Cmd::Data;
        self.frame.payload.clear();
    }
}

/// A free list of [`SessionState`] objects shared by all sessions.
pub struct SessionPool {
    free: Mutex<Vec<Box<SessionState>>>,
}

impl SessionPool {
    /// Create an empty pool.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
        })
    }

    /// Take a session object, reusing a pooled one when available.
    pub fn acquire(self: &Arc<Self>) -> PooledSession {
        let state = self.free.lock().pop().unwrap_or_else(SessionState::new);
        PooledSession {
            state: Some(state),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut state: Box<SessionState>) {
        state.reset();
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(state);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.free.lock().len()
    }
}

/// Guard handing a [`SessionState`] back to its pool on drop.
pub struct PooledSession {
    state: Option<Box<SessionState>>,
    pool: Arc<SessionPool>,
}

impl std::ops::Deref for PooledSession {
    type Target = SessionState;

    fn deref(&self) -> &Self::Target {
        self.state.as_ref().expect("session state present until drop")
    }
}

impl std::ops::DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.state.as_mut().expect("session state present until drop")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.pool.release(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Cmd;

    #[test]
    fn test_acquire_release_reuses_object() {
        let pool = SessionPool::new();
        {
            let mut session = pool.acquire();
            session.id = 17;
            session.frame.cmd = Cmd::Done;
            session.buf.truncate(10);
        }
        assert_eq!(pool.len(), 1);

        let session = pool.acquire();
        assert_eq!(session.id, 0);
        assert_eq!(session.frame.cmd, Cmd::Data);
        assert_eq!(session.buf.len(), MAX_DATA_PAYLOAD);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_release_clears_error_slots() {
        let pool = SessionPool::new();
        {
            let mut session = pool.acquire();
            session.read_err = Some(std::io::Error::other("boom"));
            session.write_err = Some(std::io::Error::other("boom"));
        }
        let session = pool.acquire();
        assert!(session.read_err.is_none());
        assert!(session.write_err.is_none());
    }

    #[test]
    fn test_pool_caps_retained_objects() {
        let pool = SessionPool::new();
        let sessions: Vec<_> = (0..MAX_POOLED + 8).map(|_| pool.acquire()).collect();
        drop(sessions);
        assert_eq!(pool.len(), MAX_POOLED);
    }
}
