//! Framed connection to the voice server.
//!
//! The client upgrades a TCP stream with an HTTP/1.1 handshake, then
//! exchanges frames:
//!
//! - **uplink**: JSON text (identification, heartbeat, events) and binary PCM
//! - **downlink**: JSON control messages routed by `type`, binary PCM routed
//!   to a [`PlaybackSink`]
//!
//! Reconnection and heartbeats are driven by [`TransportClient::update`].

mod client;
mod dispatch;
pub mod frame;
mod handshake;
mod message;
mod session;

pub use client::{
    AsyncStream, BoxedStream, Connector, TcpConnector, TransportClient, TransportClientBuilder,
};
pub use dispatch::{ControlHandler, LoggingHandler, PlaybackSink};
pub use handshake::accept_key;
pub use message::{Capabilities, CommandMessage, MessageType, OutboundMessage};
pub use session::{ConnectionStatus, TransportSession};
