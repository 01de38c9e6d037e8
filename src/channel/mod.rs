//! The shared multiplexed channel between client and server.
//!
//! One long-lived TCP (or TLS) connection carries every session. The mux
//! layer frames each session's traffic into envelopes and routes them to
//! per-stream queues; the factory owns the client-side connection and
//! repairs it with single-flight reconnection when it breaks.

mod factory;
mod mux;

pub use factory::ChannelFactory;
pub use mux::{FrameReceiver, FrameSender, FrameStream, MuxChannel};
