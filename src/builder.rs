//! Builder pattern for a device [`Session`].

use std::sync::Arc;

use crate::device::{Amplifier, AudioDevice, LoggingAmplifier};
use crate::engine::AudioEngine;
use crate::session::Session;
use crate::transport::{Connector, ControlHandler, PlaybackSink, TransportClient};
use crate::{event_callback, AppConfig, ConfigError, DeviceEvent, EventCallback};

/// Entry point for building a device session.
///
/// # Example
///
/// ```no_run
/// use echo_link::{AppConfig, EchoLink, MockDevice};
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), echo_link::ConfigError> {
/// let device = MockDevice::new();
/// let session = EchoLink::builder()
///     .device(Arc::new(device.clone()))
///     .amplifier(Arc::new(device.amplifier()))
///     .config(AppConfig::load("echo-link.toml")?)
///     .on_event(|e| tracing::info!(?e, indicator = ?e.indicator_state(), "device event"))
///     .start()
///     .await?;
///
/// // Tasks run in the background...
///
/// session.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EchoLink;

impl EchoLink {
    /// Creates a new builder.
    pub fn builder() -> EchoLinkBuilder {
        EchoLinkBuilder::new()
    }
}

/// Builder for configuring and starting a device session.
#[must_use]
pub struct EchoLinkBuilder {
    device: Option<Arc<dyn AudioDevice>>,
    amplifier: Option<Arc<dyn Amplifier>>,
    config: AppConfig,
    control: Option<Arc<dyn ControlHandler>>,
    connector: Option<Arc<dyn Connector>>,
    event_callback: Option<EventCallback>,
    mic_debug: bool,
}

impl Default for EchoLinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoLinkBuilder {
    /// Creates a builder with default configuration and no device.
    pub fn new() -> Self {
        Self {
            device: None,
            amplifier: None,
            config: AppConfig::default(),
            control: None,
            connector: None,
            event_callback: None,
            mic_debug: false,
        }
    }

    /// Sets the audio hardware. Required.
    pub fn device(mut self, device: Arc<dyn AudioDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the speaker amplifier.
    ///
    /// Default: [`LoggingAmplifier`].
    pub fn amplifier(mut self, amplifier: Arc<dyn Amplifier>) -> Self {
        self.amplifier = Some(amplifier);
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the receiver for server control messages.
    pub fn control_handler(mut self, handler: Arc<dyn ControlHandler>) -> Self {
        self.control = Some(handler);
        self
    }

    /// Uses a custom connector instead of TCP.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Starts with mic debug mode on: the microphone records regardless of
    /// the connection and its level is logged.
    pub fn mic_debug(mut self, enabled: bool) -> Self {
        self.mic_debug = enabled;
        self
    }

    /// Sets a callback for device events (indicator changes, overflows,
    /// connection changes).
    ///
    /// The callback runs on the thread that raised the event, which may be
    /// a worker thread. Keep it fast.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Builds the engine and transport and starts the session tasks.
    ///
    /// Makes one connection attempt before returning, whatever the
    /// auto-reconnect setting. A failed attempt is not an error: with
    /// auto-reconnect on, the session keeps retrying in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid or no device
    /// was provided.
    pub async fn start(self) -> Result<Session, ConfigError> {
        self.config.validate()?;
        let device = self
            .device
            .ok_or_else(|| ConfigError::invalid("device", "no audio device provided"))?;
        let amplifier: Arc<dyn Amplifier> = match self.amplifier {
            Some(amplifier) => amplifier,
            None => Arc::new(LoggingAmplifier),
        };
        let AppConfig {
            mic_mode,
            session,
            engine,
            transport,
        } = self.config;

        let engine = Arc::new(AudioEngine::new(
            engine,
            device,
            amplifier,
            self.event_callback.clone(),
        ));
        let playback: Arc<dyn PlaybackSink> = engine.clone();

        let (host, port) = (transport.host.clone(), transport.port);
        let auto_reconnect = transport.auto_reconnect;
        let mut client = TransportClient::builder(transport).playback(playback);
        if let Some(connector) = self.connector {
            client = client.connector(connector);
        }
        if let Some(control) = self.control {
            client = client.control_handler(control);
        }
        if let Some(callback) = self.event_callback {
            client = client.event_callback(callback);
        }
        let client = client.build();

        // Auto-reconnect only governs retries; the first attempt always runs
        if let Err(e) = client.connect(&host, port).await {
            if auto_reconnect {
                tracing::warn!(
                    host = %host,
                    port,
                    error = %e,
                    "initial connection failed, retrying in background"
                );
            } else {
                tracing::warn!(host = %host, port, error = %e, "initial connection failed");
            }
        }

        Ok(Session::start(&session, mic_mode, self.mic_debug, engine, client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockDevice;

    #[tokio::test]
    async fn test_start_requires_device() {
        let err = EchoLink::builder().start().await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "device", .. }));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = AppConfig::default();
        config.engine.ring_buffer_capacity = 0;
        let err = EchoLink::builder()
            .device(Arc::new(MockDevice::new()))
            .config(config)
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
