//! JSON text messages exchanged with the server.

use serde::{Deserialize, Serialize};

/// Features announced in the identification message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Microphone and speaker.
    pub audio: bool,
    /// RGB indicator.
    pub led: bool,
    /// Push button.
    pub button: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            audio: true,
            led: true,
            button: true,
        }
    }
}

/// Messages the device sends.
///
/// Serialized with a `type` tag and camelCase fields:
///
/// ```
/// use echo_link::OutboundMessage;
///
/// let msg = OutboundMessage::Heartbeat {
///     client_id: "echo_001".into(),
///     timestamp: 42,
/// };
/// assert_eq!(
///     serde_json::to_string(&msg).unwrap(),
///     r#"{"type":"heartbeat","clientId":"echo_001","timestamp":42}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    /// First frame on every connection.
    #[serde(rename_all = "camelCase")]
    Identification {
        /// Device identifier.
        client_id: String,
        /// Announced features.
        capabilities: Capabilities,
        /// Firmware version.
        version: String,
        /// Milliseconds since the client started.
        timestamp: u64,
    },

    /// Periodic keepalive.
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        /// Device identifier.
        client_id: String,
        /// Milliseconds since the client started.
        timestamp: u64,
    },

    /// A named device event (button press, state change).
    #[serde(rename_all = "camelCase")]
    Event {
        /// Event name.
        event: String,
        /// Device identifier.
        client_id: String,
        /// Milliseconds since the client started.
        timestamp: u64,
    },
}

impl OutboundMessage {
    /// Serializes the message to its wire text.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; cannot happen for these variants in practice.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Classification of an inbound text message by its `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `identification`
    Identification,
    /// `event`
    Event,
    /// `audio`
    Audio,
    /// `command`
    Command,
    /// `config`
    Config,
    /// `ota`
    Ota,
    /// `heartbeat`
    Heartbeat,
    /// Missing, non-string or unrecognized `type`.
    Unknown,
}

impl MessageType {
    /// Maps a `type` value to its classification.
    pub fn from_type(value: &str) -> Self {
        match value {
            "identification" => Self::Identification,
            "event" => Self::Event,
            "audio" => Self::Audio,
            "command" => Self::Command,
            "config" => Self::Config,
            "ota" => Self::Ota,
            "heartbeat" => Self::Heartbeat,
            _ => Self::Unknown,
        }
    }

    /// Parses `text` as JSON and classifies it.
    ///
    /// # Errors
    ///
    /// Returns the parse error for invalid JSON.
    pub fn classify(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Ok(value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .map_or(Self::Unknown, Self::from_type))
    }
}

/// Typed view of a `command` message, for handlers that want one.
///
/// Fields the server omits default to empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CommandMessage {
    /// Command name, e.g. `led`.
    pub command: String,
    /// Optional target component.
    pub target: String,
    /// Color argument for `led` commands.
    pub color: String,
    /// Effect argument for `led` commands.
    pub effect: String,
}

impl CommandMessage {
    /// Parses a raw `command` payload.
    ///
    /// # Errors
    ///
    /// Returns the parse error for invalid JSON or mistyped fields.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identification_wire_format() {
        let msg = OutboundMessage::Identification {
            client_id: "echo_001".into(),
            capabilities: Capabilities::default(),
            version: "1.0.0".into(),
            timestamp: 1234,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "type": "identification",
                "clientId": "echo_001",
                "capabilities": {"audio": true, "led": true, "button": true},
                "version": "1.0.0",
                "timestamp": 1234
            })
        );
    }

    #[test]
    fn test_event_wire_format() {
        let msg = OutboundMessage::Event {
            event: "button_pressed".into(),
            client_id: "echo_001".into(),
            timestamp: 7,
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"event","event":"button_pressed","clientId":"echo_001","timestamp":7}"#
        );
    }

    #[test]
    fn test_classify() {
        let cases = [
            (r#"{"type":"command","command":"led"}"#, MessageType::Command),
            (r#"{"type":"config"}"#, MessageType::Config),
            (r#"{"type":"ota","url":"x"}"#, MessageType::Ota),
            (r#"{"type":"heartbeat"}"#, MessageType::Heartbeat),
            (r#"{"type":"identification"}"#, MessageType::Identification),
            (r#"{"type":"event"}"#, MessageType::Event),
            (r#"{"type":"audio"}"#, MessageType::Audio),
            (r#"{"type":"weather"}"#, MessageType::Unknown),
            (r#"{"type":7}"#, MessageType::Unknown),
            (r#"{"command":"led"}"#, MessageType::Unknown),
            (r#"[1,2,3]"#, MessageType::Unknown),
        ];
        for (text, expected) in cases {
            assert_eq!(MessageType::classify(text).unwrap(), expected, "{text}");
        }
    }

    #[test]
    fn test_classify_whitespace_and_order() {
        let text = r#"{ "command" : "led", "type" : "command" }"#;
        assert_eq!(MessageType::classify(text).unwrap(), MessageType::Command);
    }

    #[test]
    fn test_classify_invalid_json() {
        assert!(MessageType::classify("{\"type\":").is_err());
        assert!(MessageType::classify("not json").is_err());
    }

    #[test]
    fn test_command_message_defaults() {
        let cmd =
            CommandMessage::parse(r#"{"type":"command","command":"led","color":"blue"}"#).unwrap();
        assert_eq!(cmd.command, "led");
        assert_eq!(cmd.color, "blue");
        assert_eq!(cmd.effect, "");
        assert_eq!(cmd.target, "");
    }
}
