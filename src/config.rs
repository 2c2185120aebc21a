//! Configuration types for the engine, the transport and the device session.
//!
//! Every struct implements [`Default`] with the values the appliance ships
//! with, and can be loaded from TOML. Durations are written as milliseconds:
//!
//! ```toml
//! mic_mode = "always_on"
//!
//! [engine]
//! gain = 2.0
//! render_idle_timeout_ms = 500
//!
//! [transport]
//! host = "192.168.1.100"
//! port = 8080
//! client_id = "echo_001"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Serde adapter storing a [`Duration`] as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for the capture and render pipelines.
///
/// # Example
///
/// ```
/// use echo_link::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     gain: 1.0,
///     render_idle_timeout: Duration::from_millis(250),
///     ..Default::default()
/// };
/// assert_eq!(config.ring_buffer_capacity, 8192);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// PCM sample rate in Hz (mono, 16-bit).
    ///
    /// Default: 16000
    pub sample_rate: u32,

    /// Capacity of each ring buffer in bytes.
    ///
    /// Default: 8192 (256ms at 16kHz)
    pub ring_buffer_capacity: usize,

    /// Bytes moved per hardware read or write.
    ///
    /// Default: 1024
    pub hardware_chunk_bytes: usize,

    /// Deadline for one hardware read in the capture worker.
    ///
    /// Default: 20ms
    #[serde(rename = "capture_read_deadline_ms", with = "duration_ms")]
    pub capture_read_deadline: Duration,

    /// Deadline for one hardware write in the render worker.
    ///
    /// Default: 100ms
    #[serde(rename = "render_write_deadline_ms", with = "duration_ms")]
    pub render_write_deadline: Duration,

    /// Bounded wait for ring buffer locks inside the workers.
    ///
    /// A timeout skips the operation for one cycle.
    /// Default: 10ms
    #[serde(rename = "worker_lock_wait_ms", with = "duration_ms")]
    pub worker_lock_wait: Duration,

    /// Bounded wait for locks on the caller-facing write and control paths.
    ///
    /// Default: 100ms
    #[serde(rename = "control_lock_wait_ms", with = "duration_ms")]
    pub control_lock_wait: Duration,

    /// Idle time after which the render worker powers the amplifier down.
    ///
    /// Default: 500ms
    #[serde(rename = "render_idle_timeout_ms", with = "duration_ms")]
    pub render_idle_timeout: Duration,

    /// Linear gain applied to every captured sample, with hard clipping.
    ///
    /// Default: 2.0
    pub gain: f32,

    /// Mean absolute magnitude below which a chunk counts as quiet.
    ///
    /// Default: 100
    pub silence_threshold: u32,

    /// Consecutive quiet chunks required to assert silence.
    ///
    /// Default: 10
    pub silence_hold_chunks: u32,

    /// Maximum samples considered by the level diagnostic.
    ///
    /// Default: 512
    pub level_window_samples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            ring_buffer_capacity: 8192,
            hardware_chunk_bytes: 1024,
            capture_read_deadline: Duration::from_millis(20),
            render_write_deadline: Duration::from_millis(100),
            worker_lock_wait: Duration::from_millis(10),
            control_lock_wait: Duration::from_millis(100),
            render_idle_timeout: Duration::from_millis(500),
            gain: 2.0,
            silence_threshold: 100,
            silence_hold_chunks: 10,
            level_window_samples: 512,
        }
    }
}

impl EngineConfig {
    /// Checks that the values can drive the pipelines.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero sizes or a non-finite gain.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_buffer_capacity == 0 {
            return Err(ConfigError::invalid(
                "engine.ring_buffer_capacity",
                "must be non-zero",
            ));
        }
        if self.hardware_chunk_bytes == 0 || self.hardware_chunk_bytes % 2 != 0 {
            return Err(ConfigError::invalid(
                "engine.hardware_chunk_bytes",
                "must be a non-zero multiple of 2",
            ));
        }
        if !self.gain.is_finite() || self.gain < 0.0 {
            return Err(ConfigError::invalid(
                "engine.gain",
                format!("{} is not a usable gain", self.gain),
            ));
        }
        Ok(())
    }
}

/// Configuration for the transport client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Server host name or address.
    ///
    /// Default: "192.168.1.100"
    pub host: String,

    /// Server port.
    ///
    /// Default: 8080
    pub port: u16,

    /// Request path used in the upgrade request.
    ///
    /// Default: "/"
    pub path: String,

    /// Identifier announced in every identification, heartbeat and event message.
    ///
    /// Default: "echo_001"
    pub client_id: String,

    /// Firmware version announced in the identification message.
    ///
    /// Default: the crate version
    pub version: String,

    /// Whether `update()` reconnects automatically while disconnected.
    ///
    /// Default: true
    pub auto_reconnect: bool,

    /// Minimum time between automatic reconnect attempts.
    ///
    /// Default: 5s
    #[serde(rename = "reconnect_interval_ms", with = "duration_ms")]
    pub reconnect_interval: Duration,

    /// Consecutive failed attempts before the session enters `Error`.
    ///
    /// Default: 5
    pub max_reconnect_attempts: u32,

    /// Interval between heartbeat messages while connected.
    ///
    /// Default: 30s
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// Deadline for the upgrade response.
    ///
    /// Default: 5s
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Bounded wait for the outbound stream lock on sends.
    ///
    /// Default: 10ms
    #[serde(rename = "send_lock_wait_ms", with = "duration_ms")]
    pub send_lock_wait: Duration,

    /// Deadline for writing one frame once the lock is held. A write that
    /// misses it drops the connection.
    ///
    /// Default: 1s
    #[serde(rename = "send_timeout_ms", with = "duration_ms")]
    pub send_timeout: Duration,

    /// Largest inbound payload accepted by the frame decoder.
    ///
    /// Default: 1 MiB
    pub max_frame_payload: usize,

    /// Mask outbound frames with a random key.
    ///
    /// Default: true
    pub mask_outbound: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 8080,
            path: "/".to_string(),
            client_id: "echo_001".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            send_lock_wait: Duration::from_millis(10),
            send_timeout: Duration::from_secs(1),
            max_frame_payload: 1024 * 1024,
            mask_outbound: true,
        }
    }
}

impl TransportConfig {
    /// Checks that the values can drive the client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty host, port 0, a zero
    /// attempt budget or a zero send timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("transport.host", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("transport.port", "must be non-zero"));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::invalid(
                "transport.max_reconnect_attempts",
                "must be at least 1",
            ));
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::invalid("transport.path", "must start with '/'"));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::invalid("transport.send_timeout_ms", "must be non-zero"));
        }
        Ok(())
    }
}

/// When the microphone should be recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicMode {
    /// Record continuously while the transport is connected.
    AlwaysOn,
    /// Record only on explicit request (button handling lives outside the crate).
    #[default]
    OnButtonPress,
}

/// Top-level configuration for a device session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Microphone policy.
    pub mic_mode: MicMode,
    /// Session task timing.
    pub session: SessionConfig,
    /// Engine settings.
    pub engine: EngineConfig,
    /// Transport settings.
    pub transport: TransportConfig,
}

/// Timing of the background tasks owned by a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval of the reconnect/heartbeat maintenance task.
    ///
    /// Default: 100ms
    #[serde(rename = "maintenance_interval_ms", with = "duration_ms")]
    pub maintenance_interval: Duration,

    /// Interval at which captured audio is drained to the transport.
    ///
    /// Default: 20ms
    #[serde(rename = "uplink_interval_ms", with = "duration_ms")]
    pub uplink_interval: Duration,

    /// Interval at which the microphone policy is re-evaluated.
    ///
    /// Default: 5s
    #[serde(rename = "policy_interval_ms", with = "duration_ms")]
    pub policy_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_millis(100),
            uplink_interval: Duration::from_millis(20),
            policy_interval: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    /// Loads and validates a TOML configuration file.
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the text cannot be parsed or validated.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.ring_buffer_capacity, 8192);
        assert_eq!(config.hardware_chunk_bytes, 1024);
        assert_eq!(config.render_idle_timeout, Duration::from_millis(500));
        assert_eq!(config.worker_lock_wait, Duration::from_millis(10));
        assert_eq!(config.silence_threshold, 100);
        assert_eq!(config.silence_hold_chunks, 10);
    }

    #[test]
    fn test_transport_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.send_timeout, Duration::from_secs(1));
        assert!(config.auto_reconnect);
        assert!(config.mask_outbound);
    }

    #[test]
    fn test_mic_mode_default() {
        assert_eq!(MicMode::default(), MicMode::OnButtonPress);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = AppConfig::from_toml(
            r#"
            mic_mode = "always_on"

            [engine]
            gain = 1.5
            render_idle_timeout_ms = 250

            [transport]
            host = "voice.local"
            port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.mic_mode, MicMode::AlwaysOn);
        assert!((config.engine.gain - 1.5).abs() < f32::EPSILON);
        assert_eq!(config.engine.render_idle_timeout, Duration::from_millis(250));
        assert_eq!(config.engine.ring_buffer_capacity, 8192);
        assert_eq!(config.transport.host, "voice.local");
        assert_eq!(config.transport.port, 9000);
        assert_eq!(config.transport.client_id, "echo_001");
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let err = AppConfig::from_toml("[engine]\nring_buffer_capacity = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "engine.ring_buffer_capacity",
                ..
            }
        ));

        let err = AppConfig::from_toml("[transport]\nport = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "transport.port", .. }));

        let err = AppConfig::from_toml("[transport]\nsend_timeout_ms = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "transport.send_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_from_toml_parse_error() {
        let err = AppConfig::from_toml("mic_mode = 42").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.toml");
        std::fs::write(&path, "[transport]\nclient_id = \"kitchen\"\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.transport.client_id, "kitchen");
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load("/nonexistent/echo.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
