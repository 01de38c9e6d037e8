//! # Ferry
//!
//! A tunneling proxy. A local SOCKS5 entry point accepts client connections
//! and relays their byte streams to a remote egress process over a single
//! persistent, multiplexed channel; the remote process dials the real target
//! and relays bytes back.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ ferry-client                                              │
//! │  SOCKS5 listener → session orchestrator → channel factory │
//! └──────────────────────────┬────────────────────────────────┘
//!                            │ one TCP/TLS connection,
//!                            │ many multiplexed frame streams
//! ┌──────────────────────────┴────────────────────────────────┐
//! │ ferry-server                                              │
//! │  channel acceptor → session orchestrator → target dialer  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Each proxied connection is one **session**: a CONNECT/CONNECTED handshake
//! followed by DATA frames in both directions until either side signals DONE.
//! Per-session scratch state (read buffer, outgoing frame, error slots) is
//! recycled through an object pool, and the shared channel is repaired with
//! single-flight reconnection so concurrent sessions never cause a redial
//! storm.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod server;
pub mod session;
pub mod socks;
pub mod tls;

pub use error::{Error, Result};

/// Maximum payload carried by a single DATA frame.
pub const MAX_DATA_PAYLOAD: usize = 32 * 1024;
