//! # echo-link
//!
//! Audio streaming engine and server transport for a voice appliance.
//!
//! `echo-link` records 16 kHz mono PCM from a microphone, streams it to a
//! voice server over a framed, reconnecting connection, and plays the
//! server's audio replies through an amplified speaker.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use echo_link::{AppConfig, EchoLink, LoggingAmplifier, CpalDevice};
//! use std::sync::Arc;
//!
//! let session = EchoLink::builder()
//!     .device(Arc::new(CpalDevice::new(16_000)))
//!     .amplifier(Arc::new(LoggingAmplifier))
//!     .config(AppConfig::load("echo-link.toml")?)
//!     .on_event(|e| tracing::info!(?e, "device event"))
//!     .start()
//!     .await?;
//!
//! // Capture follows the mic policy; server audio plays as it arrives
//! tokio::signal::ctrl_c().await?;
//! session.stop().await;
//! ```
//!
//! ## Architecture
//!
//! The crate keeps a strict boundary between hardware and network:
//!
//! - **Capture worker** (OS thread): reads the device, applies gain and
//!   silence detection, publishes into the capture ring buffer
//! - **Render worker** (OS thread): drains the render ring buffer to the
//!   speaker, fills gaps with silence, powers the amplifier down when idle
//! - **Transport** (tokio): handshake, frame codec, message routing,
//!   reconnection and heartbeats
//! - **Session** (tokio): pumps captured audio uplink and applies the mic policy
//!
//! Workers never block on the network, and locks shared with them are only
//! taken with a bounded wait.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
mod chunk;
mod config;
mod device;
mod engine;
mod error;
mod event;
mod pipeline;
mod session;
pub mod transport;

pub use builder::{EchoLink, EchoLinkBuilder};
pub use chunk::{AudioChunk, BYTES_PER_SAMPLE};
pub use config::{AppConfig, EngineConfig, MicMode, SessionConfig, TransportConfig};
#[cfg(feature = "host-audio")]
pub use device::CpalDevice;
pub use device::{
    Amplifier, AmplifierState, AudioDevice, DeviceCall, LoggingAmplifier, MockAmplifier,
    MockDevice,
};
pub use engine::{AudioEngine, EngineStats};
pub use error::{ConfigError, DeviceError, EngineError, FrameError, TransportError};
pub use event::{event_callback, DeviceEvent, EventCallback, IndicatorState};
pub use pipeline::RingBuffer;
pub use session::{Session, SessionStats};
pub use transport::{
    Capabilities, CommandMessage, ConnectionStatus, Connector, ControlHandler, LoggingHandler,
    MessageType, OutboundMessage, PlaybackSink, TcpConnector, TransportClient,
    TransportClientBuilder, TransportSession,
};
