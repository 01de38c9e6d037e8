//! Error types for the ferry proxy.

use thiserror::Error;

/// Result type alias for ferry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tunneling.
#[derive(Error, Debug)]
pub enum Error {
    /// The shared channel could not be dialed or redialed
    #[error("failed to dial proxy channel: {0}")]
    Dial(String),

    /// A frame carried a command invalid for the current protocol state
    #[error("unexpected command {cmd} (session {id})")]
    UnexpectedCommand {
        /// Raw command byte of the offending frame
        cmd: u8,
        /// Session id the frame carried
        id: i64,
    },

    /// The egress side could not reach the requested target
    #[error("failed to connect to target: {0}")]
    TargetDial(#[source] std::io::Error),

    /// Socket or stream I/O failure outside the expected EOF/deadline cases
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The shared channel is gone; the owning stream can no longer send
    #[error("proxy channel closed")]
    ChannelClosed,

    /// The peer closed this multiplexed stream
    #[error("stream closed by peer")]
    StreamClosed,

    /// Malformed frame or envelope on the wire
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Create a new channel-dial error.
    pub fn dial(msg: impl Into<String>) -> Self {
        Error::Dial(msg.into())
    }

    /// Create a new invalid-frame error.
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Error::InvalidFrame(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Check whether this error is a protocol violation (never retried).
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedCommand { .. } | Error::InvalidFrame(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnexpectedCommand { cmd: 7, id: 42 };
        assert_eq!(err.to_string(), "unexpected command 7 (session 42)");

        let err = Error::ChannelClosed;
        assert_eq!(err.to_string(), "proxy channel closed");
    }

    #[test]
    fn test_protocol_violation() {
        assert!(Error::UnexpectedCommand { cmd: 9, id: 0 }.is_protocol_violation());
        assert!(Error::invalid_frame("short").is_protocol_violation());
        assert!(!Error::ChannelClosed.is_protocol_violation());
    }
}
