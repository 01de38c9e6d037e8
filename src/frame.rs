//! The wire message unit exchanged over a session's stream.
//!
//! Each frame has a 13-byte header: cmd(1) + id(8) + payload_len(4), followed
//! by the payload. The id is the session id — zero only during the initial
//! CONNECT/CONNECTED exchange, non-zero for the session's lifetime after.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::MAX_DATA_PAYLOAD;

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Frame commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    /// Initiator requests a session to the target carried in the payload.
    Connect = 0,
    /// Responder acknowledges: the session is established under `id`.
    Connected = 1,
    /// Stream data, up to [`MAX_DATA_PAYLOAD`] bytes per frame.
    Data = 2,
    /// Sender's local socket reached end of stream; empty payload.
    Done = 3,
}

impl Cmd {
    fn from_u8(v: u8, id: i64) -> Result<Self> {
        match v {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Connected),
            2 => Ok(Self::Data),
            3 => Ok(Self::Done),
            _ => Err(Error::UnexpectedCommand { cmd: v, id }),
        }
    }
}

/// The atomic wire message of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Session id (0 only during the handshake exchange).
    pub id: i64,
    /// Frame command.
    pub cmd: Cmd,
    /// CONNECT: target address bytes; DATA: stream data; otherwise unused.
    pub payload: Vec<u8>,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            id: 0,
            cmd: Cmd::Data,
            payload: Vec::new(),
        }
    }
}

impl Frame {
    /// Create a CONNECT frame carrying the target address payload.
    pub fn connect(target: &[u8]) -> Self {
        Self {
            id: 0,
            cmd: Cmd::Connect,
            payload: target.to_vec(),
        }
    }

    /// Create a DONE frame for the given session.
    pub fn done(id: i64) -> Self {
        Self {
            id,
            cmd: Cmd::Done,
            payload: Vec::new(),
        }
    }

    /// Encode the frame into bytes for transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.cmd as u8);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    /// Decode a frame from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::invalid_frame(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let id = i64::from_be_bytes([
            data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
        ]);
        let cmd = Cmd::from_u8(data[0], id)?;
        let len = u32::from_be_bytes([data[9], data[10], data[11], data[12]]) as usize;

        if len > MAX_DATA_PAYLOAD {
            return Err(Error::invalid_frame(format!(
                "payload too large: {} bytes",
                len
            )));
        }
        if data.len() < FRAME_HEADER_SIZE + len {
            return Err(Error::invalid_frame(format!(
                "frame truncated: header says {} payload bytes, got {}",
                len,
                data.len() - FRAME_HEADER_SIZE
            )));
        }

        Ok(Self {
            id,
            cmd,
            payload: data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame {
            id: 42,
            cmd: Cmd::Data,
            payload: b"hello world".to_vec(),
        };
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();

        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.cmd, Cmd::Data);
        assert_eq!(decoded.payload, b"hello world");
    }

    #[test]
    fn test_connect_roundtrip() {
        let frame = Frame::connect(b"\x03\x0bexample.com\x01\xbb");
        let decoded = Frame::decode(&frame.encode()).unwrap();

        assert_eq!(decoded.id, 0);
        assert_eq!(decoded.cmd, Cmd::Connect);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn test_done_has_empty_payload() {
        let decoded = Frame::decode(&Frame::done(7).encode()).unwrap();
        assert_eq!(decoded.cmd, Cmd::Done);
        assert_eq!(decoded.id, 7);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_unknown_cmd_rejected() {
        let mut encoded = Frame::done(9).encode().to_vec();
        encoded[0] = 0x2a;
        match Frame::decode(&encoded) {
            Err(Error::UnexpectedCommand { cmd, id }) => {
                assert_eq!(cmd, 0x2a);
                assert_eq!(id, 9);
            }
            other => panic!("expected UnexpectedCommand, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let encoded = Frame {
            id: 1,
            cmd: Cmd::Data,
            payload: vec![0u8; 16],
        }
        .encode();
        assert!(Frame::decode(&encoded[..FRAME_HEADER_SIZE + 8]).is_err());
        assert!(Frame::decode(&encoded[..4]).is_err());
    }

    #[test]
    fn test_negative_id_roundtrip() {
        let frame = Frame {
            id: -1,
            cmd: Cmd::Connected,
            payload: Vec::new(),
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap().id, -1);
    }
}
