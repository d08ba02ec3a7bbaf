//! Message types for the Pusher Channels protocol.
//!
//! Every frame on the wire is a JSON object with an `event` name and an opaque
//! `data` field. Events in the `pusher:` namespace drive the connection and
//! subscription lifecycle; everything else is application defined.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// Reserved event names.
pub mod events {
    /// Prefix of protocol-control events.
    pub const PROTOCOL_PREFIX: &str = "pusher:";
    /// Prefix of client-originated events.
    pub const CLIENT_PREFIX: &str = "client-";

    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const ERROR: &str = "pusher:error";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
}

/// Error codes carried by `pusher:error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    /// The client requested a protocol version this server does not speak.
    UnsupportedProtocol = 4007,
    /// Private channel authorization failed.
    Unauthorized = 4009,
    /// The application has reached its connection limit.
    OverCapacity = 4100,
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            4007 => Ok(ErrorCode::UnsupportedProtocol),
            4009 => Ok(ErrorCode::Unauthorized),
            4100 => Ok(ErrorCode::OverCapacity),
            _ => Err("Unknown error code"),
        }
    }
}

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Event name.
    pub event: String,
    /// Target channel, only present on client events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event payload, left undecoded until the event is classified.
    #[serde(default)]
    pub data: Value,
}

impl IncomingMessage {
    /// Create a new incoming message.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel: None,
            data,
        }
    }

    /// Attach a target channel.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Whether this is a protocol-control event.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        self.event.starts_with(events::PROTOCOL_PREFIX)
    }

    /// The control action without the `pusher:` prefix, e.g. `subscribe`.
    #[must_use]
    pub fn protocol_action(&self) -> Option<&str> {
        self.event.strip_prefix(events::PROTOCOL_PREFIX)
    }

    /// Decode the payload into a typed structure.
    ///
    /// Clients send the payload either as a JSON object or as a string holding
    /// JSON; both forms are accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let decoded = match &self.data {
            Value::String(raw) => serde_json::from_str(raw),
            other => T::deserialize(other),
        };
        decoded.map_err(ProtocolError::InvalidPayload)
    }
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Event name.
    pub event: String,
    /// Channel the event belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event payload.
    pub data: Value,
}

impl OutgoingMessage {
    /// Create an application event on a channel.
    #[must_use]
    pub fn event(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel: Some(channel.into()),
            data,
        }
    }

    /// Create the handshake frame sent once a connection is registered.
    ///
    /// The payload is a JSON-encoded string, as the protocol mandates.
    #[must_use]
    pub fn connection_established(socket_id: &str, activity_timeout: u64) -> Self {
        let data = serde_json::json!({
            "socket_id": socket_id,
            "activity_timeout": activity_timeout,
        });
        Self {
            event: events::CONNECTION_ESTABLISHED.to_string(),
            channel: None,
            data: Value::String(data.to_string()),
        }
    }

    /// Create a `pusher:error` frame.
    #[must_use]
    pub fn error(message: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self {
            event: events::ERROR.to_string(),
            channel: None,
            data: serde_json::json!({ "message": message.into(), "code": code }),
        }
    }

    /// Create a `pusher:pong` frame.
    #[must_use]
    pub fn pong() -> Self {
        Self {
            event: events::PONG.to_string(),
            channel: None,
            data: Value::Object(serde_json::Map::new()),
        }
    }

    /// Create the acknowledgment for a successful subscription.
    #[must_use]
    pub fn subscription_succeeded(channel: impl Into<String>) -> Self {
        Self {
            event: events::SUBSCRIPTION_SUCCEEDED.to_string(),
            channel: Some(channel.into()),
            data: Value::String("{}".to_string()),
        }
    }
}

/// Payload of `pusher:subscribe`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// Channel to subscribe to.
    pub channel: String,
    /// Authorization token (`<key>:<hex signature>`) for private channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    /// Additional channel data, signed along with the token when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

impl SubscribePayload {
    /// Create a payload for a channel that needs no authorization.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Attach an authorization token.
    #[must_use]
    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    /// Attach channel data.
    #[must_use]
    pub fn with_channel_data(mut self, channel_data: impl Into<String>) -> Self {
        self.channel_data = Some(channel_data.into());
        self
    }
}

/// Payload of `pusher:unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribePayload {
    /// Channel to leave.
    pub channel: String,
}

/// Decoded payload of `pusher:connection_established`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    /// Server-assigned socket id.
    pub socket_id: String,
    /// Seconds of inactivity after which the client should ping.
    pub activity_timeout: u64,
}

/// Payload of `pusher:error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Human-readable error message.
    pub message: String,
    /// Error code, if the error has one.
    pub code: Option<ErrorCode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_classification() {
        let subscribe = IncomingMessage::new(events::SUBSCRIBE, json!({"channel": "chat"}));
        assert!(subscribe.is_protocol());
        assert_eq!(subscribe.protocol_action(), Some("subscribe"));

        let client = IncomingMessage::new("client-typing", json!({}));
        assert!(!client.is_protocol());
        assert_eq!(client.protocol_action(), None);

        // Internal events are not in the control namespace.
        let internal = IncomingMessage::new(events::SUBSCRIPTION_SUCCEEDED, json!({}));
        assert!(!internal.is_protocol());
    }

    #[test]
    fn test_payload_object_and_string_forms() {
        let object = IncomingMessage::new(
            events::SUBSCRIBE,
            json!({"channel": "private-room", "auth": "key:abcd"}),
        );
        let payload: SubscribePayload = object.payload().unwrap();
        assert_eq!(payload.channel, "private-room");
        assert_eq!(payload.auth.as_deref(), Some("key:abcd"));
        assert!(payload.channel_data.is_none());

        let string = IncomingMessage::new(
            events::UNSUBSCRIBE,
            Value::String(r#"{"channel":"chat"}"#.to_string()),
        );
        let payload: UnsubscribePayload = string.payload().unwrap();
        assert_eq!(payload.channel, "chat");
    }

    #[test]
    fn test_payload_mismatch() {
        let msg = IncomingMessage::new(events::SUBSCRIBE, json!({"room": 1}));
        assert!(matches!(
            msg.payload::<SubscribePayload>(),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_connection_established_data_is_string() {
        let msg = OutgoingMessage::connection_established("123.456", 120);
        assert_eq!(msg.event, events::CONNECTION_ESTABLISHED);

        let Value::String(raw) = &msg.data else {
            panic!("expected string payload, got {:?}", msg.data);
        };
        let data: ConnectionEstablished = serde_json::from_str(raw).unwrap();
        assert_eq!(data.socket_id, "123.456");
        assert_eq!(data.activity_timeout, 120);
    }

    #[test]
    fn test_error_frame() {
        let msg = OutgoingMessage::error("invalid auth signature", Some(ErrorCode::Unauthorized));
        assert_eq!(msg.event, events::ERROR);
        assert_eq!(msg.data["code"], json!(4009));
        assert_eq!(msg.data["message"], json!("invalid auth signature"));

        let data: ErrorData = serde_json::from_value(msg.data).unwrap();
        assert_eq!(data.code, Some(ErrorCode::Unauthorized));
    }

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::try_from(4009), Ok(ErrorCode::Unauthorized));
        assert_eq!(ErrorCode::try_from(4100), Ok(ErrorCode::OverCapacity));
        assert_eq!(u16::from(ErrorCode::UnsupportedProtocol), 4007);
        assert!(ErrorCode::try_from(1000).is_err());
    }

    #[test]
    fn test_subscription_succeeded_shape() {
        let msg = OutgoingMessage::subscription_succeeded("chat");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "pusher_internal:subscription_succeeded",
                "channel": "chat",
                "data": "{}",
            })
        );
    }

    #[test]
    fn test_pong_has_no_channel() {
        let value = serde_json::to_value(OutgoingMessage::pong()).unwrap();
        assert_eq!(value, json!({"event": "pusher:pong", "data": {}}));
    }
}
