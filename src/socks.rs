//! SOCKS5 front end.
//!
//! The client binary listens on a local port and negotiates SOCKS5 with each
//! connection. CONNECT requests yield the raw SOCKS address payload, which is
//! carried opaquely in the CONNECT frame and decoded again by the egress side
//! with [`parse_target_addr`]. UDP ASSOCIATE requests are a distinct control
//! path that never touches the frame relay.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::{Error, Result};

/// Outcome of SOCKS5 negotiation on an accepted local connection.
pub enum TargetRequest {
    /// CONNECT: raw target address payload (atyp + address + port).
    Connect(Vec<u8>),
    /// UDP ASSOCIATE: the client was told to send datagrams to `socket`.
    /// The TCP connection is held open only to detect client disconnect.
    UdpAssociate {
        /// UDP socket advertised to the client; released when the
        /// association ends.
        socket: UdpSocket,
    },
}

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Negotiate SOCKS5 on an accepted local connection.
///
/// Handles the greeting (no authentication) and the request. For CONNECT the
/// success reply is sent immediately and the address payload returned; the
/// tunnel handshake happens afterwards, so a failed tunnel surfaces to the
/// client as a dropped connection rather than a SOCKS error.
pub async fn negotiate(client: &mut TcpStream) -> Result<TargetRequest> {
    // Greeting: version, method count, methods
    let mut buf = [0u8; 258];
    let n = client.read(&mut buf).await?;
    if n < 2 || buf[0] != SOCKS_VERSION {
        return Err(Error::invalid_frame("not SOCKS5"));
    }
    client.write_all(&[SOCKS_VERSION, 0x00]).await?;

    // Request: version, command, reserved, address type
    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(Error::invalid_frame("bad request version"));
    }

    match req[1] {
        CMD_CONNECT => {
            let payload = read_addr_payload(client, req[3]).await?;
            client
                .write_all(&[SOCKS_VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            Ok(TargetRequest::Connect(payload))
        }
        CMD_UDP_ASSOCIATE => {
            // Consume the client's declared address, then advertise a fresh
            // UDP socket bound next to the TCP listener.
            let _ = read_addr_payload(client, req[3]).await?;
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            let bound = socket.local_addr()?;

            let mut reply = vec![SOCKS_VERSION, 0x00, 0x00, 0x01];
            match bound.ip() {
                std::net::IpAddr::V4(ip) => reply.extend_from_slice(&ip.octets()),
                std::net::IpAddr::V6(_) => reply.extend_from_slice(&[0, 0, 0, 0]),
            }
            reply.extend_from_slice(&bound.port().to_be_bytes());
            client.write_all(&reply).await?;

            Ok(TargetRequest::UdpAssociate { socket })
        }
        _ => {
            // Command not supported
            client
                .write_all(&[SOCKS_VERSION, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            Err(Error::invalid_frame("unsupported SOCKS command"))
        }
    }
}

/// Read the address portion of a SOCKS5 request, returning the raw payload
/// (atyp + address + port) used as the CONNECT frame body.
async fn read_addr_payload(client: &mut TcpStream, atyp: u8) -> Result<Vec<u8>> {
    match atyp {
        // IPv4: 4 bytes + 2 port bytes
        0x01 => {
            let mut addr = vec![0x01];
            let mut ip_port = [0u8; 6];
            client.read_exact(&mut ip_port).await?;
            addr.extend_from_slice(&ip_port);
            Ok(addr)
        }
        // Domain: 1 byte len + domain + 2 port bytes
        0x03 => {
            let mut len_buf = [0u8; 1];
            client.read_exact(&mut len_buf).await?;
            let domain_len = len_buf[0] as usize;
            let mut domain_port = vec![0u8; domain_len + 2];
            client.read_exact(&mut domain_port).await?;
            let mut addr = vec![0x03, len_buf[0]];
            addr.extend_from_slice(&domain_port);
            Ok(addr)
        }
        // IPv6: 16 bytes + 2 port bytes
        0x04 => {
            let mut addr = vec![0x04];
            let mut ip_port = [0u8; 18];
            client.read_exact(&mut ip_port).await?;
            addr.extend_from_slice(&ip_port);
            Ok(addr)
        }
        _ => {
            client
                .write_all(&[SOCKS_VERSION, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            Err(Error::invalid_frame("unsupported address type"))
        }
    }
}

/// Parse a SOCKS5-style target address from a CONNECT frame payload.
/// Returns (host, port).
pub fn parse_target_addr(payload: &[u8]) -> Result<(String, u16)> {
    if payload.is_empty() {
        return Err(Error::invalid_frame("empty address payload"));
    }

    match payload[0] {
        0x01 => {
            if payload.len() < 7 {
                return Err(Error::invalid_frame("IPv4 address too short"));
            }
            let ip = format!(
                "{}.{}.{}.{}",
                payload[1], payload[2], payload[3], payload[4]
            );
            let port = u16::from_be_bytes([payload[5], payload[6]]);
            Ok((ip, port))
        }
        0x03 => {
            if payload.len() < 2 {
                return Err(Error::invalid_frame("domain address too short"));
            }
            let domain_len = payload[1] as usize;
            if payload.len() < 2 + domain_len + 2 {
                return Err(Error::invalid_frame("domain address truncated"));
            }
            let domain = String::from_utf8_lossy(&payload[2..2 + domain_len]).to_string();
            let port = u16::from_be_bytes([payload[2 + domain_len], payload[2 + domain_len + 1]]);
            Ok((domain, port))
        }
        0x04 => {
            if payload.len() < 19 {
                return Err(Error::invalid_frame("IPv6 address too short"));
            }
            let mut segments = [0u16; 8];
            for (i, seg) in segments.iter_mut().enumerate() {
                *seg = u16::from_be_bytes([payload[1 + i * 2], payload[2 + i * 2]]);
            }
            let ip = format!(
                "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
                segments[0],
                segments[1],
                segments[2],
                segments[3],
                segments[4],
                segments[5],
                segments[6],
                segments[7]
            );
            let port = u16::from_be_bytes([payload[17], payload[18]]);
            Ok((ip, port))
        }
        other => Err(Error::invalid_frame(format!(
            "unknown address type: 0x{:02x}",
            other
        ))),
    }
}

/// Encode a host:port pair into the SOCKS address payload format.
///
/// Used by tests and by callers that resolve targets themselves.
pub fn encode_target_addr(host: &str, port: u16) -> Vec<u8> {
    let mut payload = Vec::new();
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        payload.push(0x01);
        payload.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
        payload.push(0x04);
        payload.extend_from_slice(&ip.octets());
    } else {
        payload.push(0x03);
        payload.push(host.len() as u8);
        payload.extend_from_slice(host.as_bytes());
    }
    payload.extend_from_slice(&port.to_be_bytes());
    payload
}
