//! Routing of decoded inbound messages to their collaborators.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::message::{CommandMessage, MessageType};
use crate::event::{emit, DeviceEvent, EventCallback};
use crate::EngineError;

/// Receiver for server-issued control messages.
///
/// Each method gets the raw JSON text of one message. All methods default
/// to doing nothing, so implementors override only what they handle.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use echo_link::{CommandMessage, ControlHandler};
///
/// struct Indicator;
///
/// #[async_trait]
/// impl ControlHandler for Indicator {
///     async fn on_command(&self, payload: &str) {
///         if let Ok(cmd) = CommandMessage::parse(payload) {
///             println!("led -> {} {}", cmd.color, cmd.effect);
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// A `command` message arrived.
    async fn on_command(&self, _payload: &str) {}

    /// A `config` message arrived.
    async fn on_config(&self, _payload: &str) {}

    /// An `ota` message arrived.
    async fn on_ota(&self, _payload: &str) {}
}

/// A [`ControlHandler`] that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl ControlHandler for LoggingHandler {
    async fn on_command(&self, payload: &str) {
        match CommandMessage::parse(payload) {
            Ok(cmd) if cmd.command == "led" => {
                tracing::info!(color = %cmd.color, effect = %cmd.effect, "led command");
            }
            Ok(cmd) => tracing::info!(command = %cmd.command, target = %cmd.target, "command"),
            Err(e) => tracing::warn!(error = %e, "malformed command"),
        }
    }

    async fn on_config(&self, _payload: &str) {
        tracing::info!("configuration message received");
    }

    async fn on_ota(&self, _payload: &str) {
        tracing::info!("ota message received");
    }
}

/// Destination for inbound binary audio.
///
/// `play` may block briefly (lock waits, output activation); it is called
/// from the blocking pool, never on a runtime worker.
pub trait PlaybackSink: Send + Sync {
    /// Queues PCM bytes for playback and returns how many were stored.
    fn play(&self, data: &[u8]) -> Result<usize, EngineError>;
}

/// Routes text messages by type and binary payloads to playback.
pub(crate) struct Dispatcher {
    control: Arc<dyn ControlHandler>,
    playback: Option<Arc<dyn PlaybackSink>>,
    events: Option<EventCallback>,
}

impl Dispatcher {
    pub fn new(
        control: Arc<dyn ControlHandler>,
        playback: Option<Arc<dyn PlaybackSink>>,
        events: Option<EventCallback>,
    ) -> Self {
        Self {
            control,
            playback,
            events,
        }
    }

    /// Classifies and routes one text message. Invalid JSON is dropped
    /// with a warning and returns `None`.
    pub async fn dispatch_text(&self, text: &str) -> Option<MessageType> {
        let kind = match MessageType::classify(text) {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!(error = %e, len = text.len(), "dropping invalid JSON message");
                return None;
            }
        };

        match kind {
            MessageType::Command => self.control.on_command(text).await,
            MessageType::Config => self.control.on_config(text).await,
            MessageType::Ota => {
                emit(self.events.as_ref(), DeviceEvent::OtaRequested);
                self.control.on_ota(text).await;
            }
            MessageType::Heartbeat => tracing::trace!("server heartbeat"),
            MessageType::Unknown => tracing::debug!("message with unknown type ignored"),
            other => tracing::debug!(kind = ?other, "message ignored"),
        }
        Some(kind)
    }

    /// Hands a binary payload to playback on the blocking pool.
    ///
    /// Completes before returning, so payloads reach the sink in order.
    pub async fn dispatch_binary(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let Some(playback) = &self.playback else {
            tracing::trace!(len = data.len(), "no playback sink, audio dropped");
            return;
        };
        let playback = Arc::clone(playback);
        let len = data.len();
        match tokio::task::spawn_blocking(move || playback.play(&data)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, len, "inbound audio dropped"),
            Err(e) => tracing::error!(error = %e, "playback task failed"),
        }
    }
}
