//! Error types for echo-link.
//!
//! Errors are split into two categories:
//! - **Start errors**: returned when a pipeline, connection or session cannot
//!   be brought up ([`EngineError`], [`TransportError`], [`ConfigError`])
//! - **Recoverable conditions**: lock timeouts, dropped bytes and transient
//!   I/O failures. These are also surfaced as errors from the call that hit
//!   them, but the caller is expected to retry on its next cycle; the runtime
//!   side is reported via [`EventCallback`](crate::EventCallback)

use std::path::PathBuf;
use std::time::Duration;

/// Errors reported by an [`AudioDevice`](crate::AudioDevice) implementation.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The hardware call did not complete before its deadline.
    #[error("hardware call timed out after {0:?}")]
    Timeout(Duration),

    /// The channel was used before `init_*` or after `teardown_*`.
    #[error("{channel} channel not initialized")]
    ChannelNotInitialized {
        /// Which hardware channel (`capture` or `render`).
        channel: &'static str,
    },

    /// An error from the underlying audio backend.
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    /// Creates a backend error with the given message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Errors from the audio engine (capture and render pipelines).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The caller passed an empty or otherwise unusable buffer.
    #[error("invalid audio input: {reason}")]
    InvalidInput {
        /// Why the input was rejected.
        reason: String,
    },

    /// A ring buffer or control lock was not acquired within the bounded wait.
    ///
    /// Recoverable: the operation was skipped and may be retried.
    #[error("{resource} lock not acquired within {waited:?}")]
    LockTimeout {
        /// Name of the contended resource.
        resource: &'static str,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A worker thread could not be spawned.
    #[error("failed to spawn {worker} worker: {source}")]
    SpawnFailed {
        /// Which worker (`capture` or `render`).
        worker: &'static str,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The audio device failed to initialize a channel.
    #[error("audio device error: {0}")]
    Device(#[from] DeviceError),
}

impl EngineError {
    /// Creates an invalid input error with the given reason.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the operation can simply be retried on the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// Violations of the frame format detected by the decoder.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame used an opcode reserved by the protocol.
    #[error("reserved opcode 0x{0:x}")]
    ReservedOpcode(u8),

    /// A reserved header bit was set without a negotiated extension.
    #[error("reserved header bits set: 0x{0:x}")]
    ReservedBits(u8),

    /// The declared payload length exceeds the configured maximum.
    #[error("payload of {len} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Declared payload length.
        len: u64,
        /// Configured maximum.
        max: usize,
    },

    /// A control frame was fragmented or carried more than 125 bytes.
    #[error("invalid control frame: {0}")]
    InvalidControlFrame(&'static str),

    /// A continuation frame arrived with no message in progress, or a new
    /// data frame arrived while one was still being assembled.
    #[error("unexpected fragment: {0}")]
    UnexpectedFragment(&'static str),

    /// A text message was not valid UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors from the transport client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The session is not in the `Connected` state or the stream is gone.
    #[error("not connected")]
    NotConnected,

    /// The outbound stream lock was not acquired within the bounded wait.
    #[error("transport busy, send skipped")]
    Busy,

    /// The caller passed an empty payload.
    #[error("invalid payload: {reason}")]
    InvalidInput {
        /// Why the payload was rejected.
        reason: String,
    },

    /// Socket I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A write did not complete before the send deadline; the connection
    /// was dropped.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// The upgrade response did not arrive before the deadline.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The server answered the upgrade request with something other than 101.
    #[error("handshake rejected: {status_line}")]
    HandshakeRejected {
        /// First line of the server response.
        status_line: String,
    },

    /// The upgrade response carried a missing or wrong `Sec-WebSocket-Accept`.
    #[error("handshake accept key mismatch")]
    AcceptMismatch,

    /// The peer violated the frame format.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// A message could not be encoded or decoded as JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The automatic reconnection budget is exhausted.
    #[error("reconnect budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Number of consecutive failed attempts.
        attempts: u32,
    },
}

impl TransportError {
    /// Creates an invalid input error with the given reason.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
