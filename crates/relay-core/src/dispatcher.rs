//! Inbound protocol dispatch.
//!
//! Turns one classified frame into channel manager calls, a pong, or a
//! client-event relay. Runs on the sender's read pump, so frames from one
//! connection are handled strictly in order.

use std::sync::Arc;

use relay_protocol::{IncomingMessage, OutgoingMessage, ProtocolError};
use tracing::{debug, trace, warn};

use crate::channel_manager::ChannelManager;
use crate::connection::ConnectionHandle;
use crate::dashboard::{self, LogDetails, LogEventType};
use crate::message::{ClientEvent, PusherMessage};
use crate::stats::StatsSink;

/// Why a client event was not relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRefusal {
    /// Event name lacks the `client-` prefix.
    NotClientEvent,
    /// The application has client messages disabled.
    Disabled,
    /// The target channel does not exist.
    UnknownChannel,
    /// The target channel is public.
    PublicChannel,
    /// The sender is not subscribed to the target channel.
    NotSubscribed,
}

/// Routes inbound messages for every connection.
#[derive(Clone)]
pub struct Dispatcher {
    channels: Arc<ChannelManager>,
    stats: Arc<dyn StatsSink>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(channels: Arc<ChannelManager>, stats: Arc<dyn StatsSink>) -> Self {
        Self { channels, stats }
    }

    /// Handle one inbound message from `conn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message payload cannot be decoded. The
    /// connection stays usable either way.
    pub fn dispatch(
        &self,
        conn: &ConnectionHandle,
        message: IncomingMessage,
    ) -> Result<(), ProtocolError> {
        match PusherMessage::classify(message)? {
            PusherMessage::Subscribe(payload) => {
                self.channels.subscribe_to_channel(conn, &payload);
            }
            PusherMessage::Unsubscribe(payload) => {
                self.channels.unsubscribe_from_channel(conn, &payload.channel);
            }
            PusherMessage::Ping => {
                trace!(socket_id = %conn.id(), "Ping");
                conn.send(&OutgoingMessage::pong());
            }
            PusherMessage::UnknownControl(action) => {
                debug!(socket_id = %conn.id(), action = %action, "Ignoring control event");
            }
            PusherMessage::Client(event) => {
                if let Err(reason) = self.relay_client_event(conn, event) {
                    debug!(socket_id = %conn.id(), ?reason, "Client event dropped");
                }
            }
        }
        Ok(())
    }

    /// Relay a client event to the other subscribers of its channel.
    ///
    /// Only `client-` events on private channels the sender is subscribed
    /// to are relayed, and only if the application allows client messages.
    /// Returns the number of recipients.
    pub fn relay_client_event(
        &self,
        conn: &ConnectionHandle,
        event: ClientEvent,
    ) -> Result<usize, RelayRefusal> {
        let app = conn.app();

        if !event.has_client_prefix() {
            return Err(RelayRefusal::NotClientEvent);
        }
        if !app.client_messages_enabled() {
            warn!(app_id = %app.id(), socket_id = %conn.id(), "Client messages are disabled");
            return Err(RelayRefusal::Disabled);
        }

        let Some(channel) = self.channels.find_channel(app.id(), &event.channel) else {
            warn!(
                app_id = %app.id(),
                channel = %event.channel,
                "Client event for unknown channel"
            );
            return Err(RelayRefusal::UnknownChannel);
        };
        if !channel.requires_auth() {
            warn!(
                app_id = %app.id(),
                channel = %event.channel,
                "Client event on public channel"
            );
            return Err(RelayRefusal::PublicChannel);
        }
        if !channel.is_subscribed(conn.id()) {
            warn!(
                app_id = %app.id(),
                socket_id = %conn.id(),
                channel = %event.channel,
                "Client event from non-subscriber"
            );
            return Err(RelayRefusal::NotSubscribed);
        }

        let ClientEvent {
            event,
            channel: channel_name,
            data,
        } = event;
        let message = OutgoingMessage::event(channel_name.as_str(), event.as_str(), data.clone());
        let recipients = channel.broadcast_except(&message, conn.id());

        self.stats.on_websocket_message(app.id());
        dashboard::log_event(
            &self.channels,
            LogEventType::ClientMessage,
            LogDetails::new(app.id())
                .channel(channel_name)
                .event(event)
                .connection(conn.id().as_str())
                .payload(data),
        );

        trace!(app_id = %app.id(), recipients, "Relayed client event");
        Ok(recipients)
    }
}
