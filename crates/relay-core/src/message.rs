//! Classification of inbound frames.
//!
//! A decoded [`IncomingMessage`] is either a protocol-control event in the
//! `pusher:` namespace or a client event addressed to a channel.

use relay_protocol::{
    events, IncomingMessage, ProtocolError, SubscribePayload, UnsubscribePayload,
};
use serde_json::Value;

/// A client event addressed to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    /// Event name.
    pub event: String,
    /// Target channel.
    pub channel: String,
    /// Event payload, relayed untouched.
    pub data: Value,
}

impl ClientEvent {
    /// Whether the event name carries the `client-` prefix that relaying requires.
    #[must_use]
    pub fn has_client_prefix(&self) -> bool {
        self.event.starts_with(events::CLIENT_PREFIX)
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum PusherMessage {
    /// `pusher:subscribe`.
    Subscribe(SubscribePayload),
    /// `pusher:unsubscribe`.
    Unsubscribe(UnsubscribePayload),
    /// `pusher:ping`.
    Ping,
    /// Any other `pusher:` event.
    UnknownControl(String),
    /// A non-control event.
    Client(ClientEvent),
}

impl PusherMessage {
    /// Classify a decoded frame and decode its payload.
    ///
    /// # Errors
    ///
    /// Returns an error if a subscribe or unsubscribe payload is malformed,
    /// or if a client event names no channel.
    pub fn classify(message: IncomingMessage) -> Result<Self, ProtocolError> {
        match message.protocol_action() {
            Some("subscribe") => message.payload().map(PusherMessage::Subscribe),
            Some("unsubscribe") => message.payload().map(PusherMessage::Unsubscribe),
            Some("ping") => Ok(PusherMessage::Ping),
            Some(other) => Ok(PusherMessage::UnknownControl(other.to_string())),
            None => {
                let IncomingMessage {
                    event,
                    channel,
                    data,
                } = message;
                let channel = channel.ok_or(ProtocolError::MissingChannel)?;
                Ok(PusherMessage::Client(ClientEvent {
                    event,
                    channel,
                    data,
                }))
            }
        }
    }
}
