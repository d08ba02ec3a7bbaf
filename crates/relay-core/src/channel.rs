//! Channel abstraction for Relay.
//!
//! A channel is a named set of subscribed connections within one application.
//! Names starting with `private-` require a signed authorization token to
//! subscribe; every other name is public.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use relay_protocol::{codec, ErrorCode, OutgoingMessage, SubscribePayload};
use tracing::{debug, error, trace, warn};

use crate::auth::{self, AuthError};
use crate::connection::{ConnectionHandle, SocketId};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 164;

/// Name prefix selecting the private variant.
pub const PRIVATE_PREFIX: &str = "private-";

/// A channel identifier.
pub type ChannelId = String;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "-_=@,.;".contains(c);
    if !name.chars().all(allowed) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Channel variant, derived from the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Anyone connected to the application may subscribe.
    Public,
    /// Subscribing requires a signature over the socket id and channel name.
    Private,
}

impl ChannelKind {
    /// Pick the variant for a channel name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.starts_with(PRIVATE_PREFIX) {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    #[must_use]
    pub fn requires_auth(&self) -> bool {
        matches!(self, ChannelKind::Private)
    }
}

/// Result of a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The connection was added. `occupied` is set when it is the first subscriber.
    Subscribed { occupied: bool },
    /// The connection was already a subscriber; nothing changed.
    AlreadySubscribed,
    /// The request was refused and the connection was sent a `pusher:error`.
    Rejected,
}

/// Result of an unsubscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// The connection was removed. `vacated` is set when it was the last subscriber.
    Unsubscribed { vacated: bool },
    /// The connection was not a subscriber.
    NotSubscribed,
}

/// A channel for pub/sub messaging.
///
/// One lock guards the subscriber set for both membership changes and
/// broadcasts, so a broadcast always sees a consistent set and never reaches a
/// connection whose unsubscribe has returned.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    /// Variant.
    kind: ChannelKind,
    /// Subscribed connections.
    subscribers: RwLock<HashMap<SocketId, ConnectionHandle>>,
}

impl Channel {
    /// Create a channel, selecting the variant from the name prefix.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        let name = name.into();
        Self {
            kind: ChannelKind::from_name(&name),
            name,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Whether subscribing requires an authorization token.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        self.kind.requires_auth()
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, socket_id: &SocketId) -> bool {
        self.subscribers.read().contains_key(socket_id)
    }

    /// Check if the channel has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Snapshot of the current subscriber ids.
    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<SocketId> {
        self.subscribers.read().keys().cloned().collect()
    }

    /// Subscribe a connection.
    ///
    /// Private channels verify the payload's token first; on failure the
    /// connection receives a `pusher:error` with code 4009 and is not added.
    /// Otherwise the connection is added once and sent a
    /// `pusher_internal:subscription_succeeded` acknowledgment. A connection
    /// already marked closed is never added.
    pub fn subscribe(
        &self,
        conn: &ConnectionHandle,
        payload: &SubscribePayload,
    ) -> SubscribeOutcome {
        if let Err(e) = self.authorize(conn, payload) {
            warn!(
                channel = %self.name,
                socket_id = %conn.id(),
                error = %e,
                "Subscription rejected"
            );
            conn.send(&OutgoingMessage::error(
                e.to_string(),
                Some(ErrorCode::Unauthorized),
            ));
            return SubscribeOutcome::Rejected;
        }

        let mut subscribers = self.subscribers.write();
        // Teardown marks the handle closed before sweeping channels, so a
        // closed handle seen here would never be swept again.
        if conn.is_closed() {
            debug!(
                channel = %self.name,
                socket_id = %conn.id(),
                "Connection closed, not subscribing"
            );
            return SubscribeOutcome::Rejected;
        }
        if subscribers.contains_key(conn.id()) {
            trace!(channel = %self.name, socket_id = %conn.id(), "Already subscribed");
            return SubscribeOutcome::AlreadySubscribed;
        }

        let occupied = subscribers.is_empty();
        subscribers.insert(conn.id().clone(), conn.clone());
        // Acknowledge under the lock so no broadcast can overtake it.
        conn.send(&OutgoingMessage::subscription_succeeded(self.name.as_str()));

        debug!(
            channel = %self.name,
            socket_id = %conn.id(),
            subscribers = subscribers.len(),
            "Connection subscribed"
        );
        SubscribeOutcome::Subscribed { occupied }
    }

    /// Unsubscribe a connection.
    pub fn unsubscribe(&self, socket_id: &SocketId) -> UnsubscribeOutcome {
        let mut subscribers = self.subscribers.write();
        if subscribers.remove(socket_id).is_none() {
            return UnsubscribeOutcome::NotSubscribed;
        }

        debug!(
            channel = %self.name,
            socket_id = %socket_id,
            subscribers = subscribers.len(),
            "Connection unsubscribed"
        );
        UnsubscribeOutcome::Unsubscribed {
            vacated: subscribers.is_empty(),
        }
    }

    /// Send a message to every subscriber.
    ///
    /// Returns the number of subscribers the message was queued for.
    pub fn broadcast(&self, message: &OutgoingMessage) -> usize {
        self.fan_out(message, None)
    }

    /// Send a message to every subscriber except `excluded`.
    ///
    /// Returns the number of subscribers the message was queued for.
    pub fn broadcast_except(&self, message: &OutgoingMessage, excluded: &SocketId) -> usize {
        self.fan_out(message, Some(excluded))
    }

    fn fan_out(&self, message: &OutgoingMessage, excluded: Option<&SocketId>) -> usize {
        let bytes = match codec::encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(channel = %self.name, error = %e, "Failed to encode broadcast");
                return 0;
            }
        };
        self.fan_out_raw(&bytes, excluded)
    }

    fn fan_out_raw(&self, bytes: &Bytes, excluded: Option<&SocketId>) -> usize {
        let subscribers = self.subscribers.read();
        let delivered = subscribers
            .values()
            .filter(|conn| Some(conn.id()) != excluded)
            .filter(|conn| conn.send_raw(bytes.clone()))
            .count();

        trace!(channel = %self.name, recipients = delivered, "Broadcast message");
        delivered
    }

    fn authorize(
        &self,
        conn: &ConnectionHandle,
        payload: &SubscribePayload,
    ) -> Result<(), AuthError> {
        match self.kind {
            ChannelKind::Public => Ok(()),
            ChannelKind::Private => {
                let message = auth::signing_string(
                    conn.id().as_str(),
                    &self.name,
                    payload.channel_data.as_deref(),
                );
                auth::verify_token(
                    conn.app().secret(),
                    payload.auth.as_deref().unwrap_or_default(),
                    &message,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Application;
    use relay_protocol::events;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn app() -> Arc<Application> {
        Arc::new(Application::new("1", "K1", "S1"))
    }

    fn connection(id: &str) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        ConnectionHandle::channel(id.into(), app(), 16)
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(serde_json::from_slice(&bytes).unwrap());
        }
        out
    }

    #[test]
    fn test_channel_kind_from_prefix() {
        for name in ["private-x", "private-", "private-room.1"] {
            assert!(Channel::new(name).requires_auth(), "{name}");
        }
        for name in ["x", "chat", "privatex", "presence-room", "Private-x", "my-private-x"] {
            assert!(!Channel::new(name).requires_auth(), "{name}");
        }
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("valid-channel_1=@,.;").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("has space").is_err());
        assert!(validate_channel_name("colon:name").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_public_subscribe_is_idempotent() {
        let channel = Channel::new("chat");
        let (conn, mut rx) = connection("1.1");
        let payload = SubscribePayload::new("chat");

        assert_eq!(
            channel.subscribe(&conn, &payload),
            SubscribeOutcome::Subscribed { occupied: true }
        );
        assert_eq!(
            channel.subscribe(&conn, &payload),
            SubscribeOutcome::AlreadySubscribed
        );
        assert_eq!(channel.subscriber_count(), 1);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], events::SUBSCRIPTION_SUCCEEDED);
        assert_eq!(frames[0]["channel"], "chat");
    }

    #[test]
    fn test_second_subscriber_does_not_occupy() {
        let channel = Channel::new("chat");
        let (a, _rx_a) = connection("1.1");
        let (b, _rx_b) = connection("1.2");
        let payload = SubscribePayload::new("chat");

        channel.subscribe(&a, &payload);
        assert_eq!(
            channel.subscribe(&b, &payload),
            SubscribeOutcome::Subscribed { occupied: false }
        );
    }

    #[test]
    fn test_unsubscribe() {
        let channel = Channel::new("chat");
        let (a, _rx_a) = connection("1.1");
        let (b, _rx_b) = connection("1.2");
        let payload = SubscribePayload::new("chat");
        channel.subscribe(&a, &payload);
        channel.subscribe(&b, &payload);

        assert_eq!(
            channel.unsubscribe(a.id()),
            UnsubscribeOutcome::Unsubscribed { vacated: false }
        );
        assert_eq!(channel.unsubscribe(a.id()), UnsubscribeOutcome::NotSubscribed);
        assert_eq!(
            channel.unsubscribe(b.id()),
            UnsubscribeOutcome::Unsubscribed { vacated: true }
        );
        assert!(channel.is_empty());
    }

    #[test]
    fn test_private_subscribe_with_valid_signature() {
        let channel = Channel::new("private-room");
        let (conn, mut rx) = connection("1.1");
        let token = auth::channel_token(conn.app(), "1.1", "private-room", None).unwrap();

        let payload = SubscribePayload::new("private-room").with_auth(token);
        assert_eq!(
            channel.subscribe(&conn, &payload),
            SubscribeOutcome::Subscribed { occupied: true }
        );
        assert_eq!(channel.subscriber_count(), 1);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], events::SUBSCRIPTION_SUCCEEDED);
    }

    #[test]
    fn test_private_subscribe_signs_channel_data() {
        let channel = Channel::new("private-room");
        let (conn, _rx) = connection("1.1");
        let data = r#"{"user_id":"42"}"#;
        let token = auth::channel_token(conn.app(), "1.1", "private-room", Some(data)).unwrap();

        // Token covers channel data, so omitting it must fail.
        let without_data = SubscribePayload::new("private-room").with_auth(token.clone());
        assert_eq!(channel.subscribe(&conn, &without_data), SubscribeOutcome::Rejected);

        let with_data = without_data.with_channel_data(data);
        assert_eq!(
            channel.subscribe(&conn, &with_data),
            SubscribeOutcome::Subscribed { occupied: true }
        );
    }

    #[test]
    fn test_private_subscribe_rejects_bad_signature() {
        let channel = Channel::new("private-room");
        let (conn, mut rx) = connection("1.1");

        // Signed for a different socket.
        let token = auth::channel_token(conn.app(), "9.9", "private-room", None).unwrap();
        let payload = SubscribePayload::new("private-room").with_auth(token);

        assert_eq!(channel.subscribe(&conn, &payload), SubscribeOutcome::Rejected);
        assert_eq!(channel.subscriber_count(), 0);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], events::ERROR);
        assert_eq!(frames[0]["data"]["code"], json!(4009));
    }

    #[test]
    fn test_private_subscribe_without_token() {
        let channel = Channel::new("private-room");
        let (conn, mut rx) = connection("1.1");

        let payload = SubscribePayload::new("private-room");
        assert_eq!(channel.subscribe(&conn, &payload), SubscribeOutcome::Rejected);
        assert_eq!(drain(&mut rx)[0]["data"]["code"], json!(4009));
    }

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let channel = Channel::new("chat");
        let payload = SubscribePayload::new("chat");
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (conn, mut rx) = connection(&format!("1.{i}"));
            channel.subscribe(&conn, &payload);
            drain(&mut rx);
            receivers.push((conn, rx));
        }

        let message = OutgoingMessage::event("chat", "message", json!("hello"));
        assert_eq!(channel.broadcast(&message), 3);

        for (_, rx) in &mut receivers {
            let frames = drain(rx);
            let expected = json!({"event": "message", "channel": "chat", "data": "hello"});
            assert_eq!(frames, vec![expected]);
        }
    }

    #[test]
    fn test_broadcast_except_excludes_exactly_one() {
        for size in 0..5usize {
            let channel = Channel::new("chat");
            let payload = SubscribePayload::new("chat");
            let mut receivers = Vec::new();
            for i in 0..size {
                let (conn, mut rx) = connection(&format!("2.{i}"));
                channel.subscribe(&conn, &payload);
                drain(&mut rx);
                receivers.push((conn, rx));
            }

            let excluded = SocketId::from("2.0");
            let message = OutgoingMessage::event("chat", "message", json!({}));
            let delivered = channel.broadcast_except(&message, &excluded);
            assert_eq!(delivered, size.saturating_sub(1));

            for (conn, rx) in &mut receivers {
                let expected = usize::from(conn.id() != &excluded);
                assert_eq!(drain(rx).len(), expected);
            }
        }
    }

    #[test]
    fn test_broadcast_skips_failed_subscriber() {
        let channel = Channel::new("chat");
        let payload = SubscribePayload::new("chat");

        let (gone, gone_rx) = connection("3.1");
        channel.subscribe(&gone, &payload);
        drop(gone_rx);

        let (alive, mut alive_rx) = connection("3.2");
        channel.subscribe(&alive, &payload);
        drain(&mut alive_rx);

        let message = OutgoingMessage::event("chat", "message", json!(1));
        assert_eq!(channel.broadcast(&message), 1);
        assert_eq!(drain(&mut alive_rx).len(), 1);
    }

    #[test]
    fn test_no_delivery_after_unsubscribe() {
        let channel = Channel::new("chat");
        let (conn, mut rx) = connection("4.1");
        channel.subscribe(&conn, &SubscribePayload::new("chat"));
        drain(&mut rx);

        channel.unsubscribe(conn.id());
        channel.broadcast(&OutgoingMessage::event("chat", "message", json!(1)));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_closed_connection_is_not_subscribed() {
        let channel = Channel::new("chat");
        let (conn, mut rx) = connection("5.1");
        conn.mark_closed();

        assert_eq!(
            channel.subscribe(&conn, &SubscribePayload::new("chat")),
            SubscribeOutcome::Rejected
        );
        assert!(channel.is_empty());
        assert!(drain(&mut rx).is_empty());
    }
}
