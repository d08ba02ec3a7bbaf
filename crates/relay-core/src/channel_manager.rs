//! Per-application channel registry.
//!
//! The manager owns every channel, keyed by application id and then by
//! channel name. Channels are created on first use and are never removed.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use relay_protocol::{OutgoingMessage, SubscribePayload};
use tracing::{debug, warn};

use crate::app::{AppId, AppRegistry};
use crate::channel::{
    validate_channel_name, Channel, ChannelId, SubscribeOutcome, UnsubscribeOutcome,
};
use crate::connection::{ConnectionHandle, SocketId};
use crate::dashboard::{self, LogDetails, LogEventType};

type AppChannels = DashMap<ChannelId, Arc<Channel>>;

/// Owner of all channels of all applications.
pub struct ChannelManager {
    /// Tenant lookup shared with the outer layers.
    apps: Arc<dyn AppRegistry>,
    /// Application id -> channel name -> channel.
    channels: DashMap<AppId, Arc<AppChannels>>,
}

impl ChannelManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(apps: Arc<dyn AppRegistry>) -> Self {
        Self {
            apps,
            channels: DashMap::new(),
        }
    }

    /// The application registry this manager was built with.
    #[must_use]
    pub fn app_registry(&self) -> &Arc<dyn AppRegistry> {
        &self.apps
    }

    fn app_channels(&self, app_id: &str) -> Option<Arc<AppChannels>> {
        self.channels.get(app_id).map(|c| Arc::clone(&c))
    }

    /// Look up a channel without creating it.
    #[must_use]
    pub fn find_channel(&self, app_id: &str, name: &str) -> Option<Arc<Channel>> {
        self.app_channels(app_id)?.get(name).map(|c| Arc::clone(&c))
    }

    /// Every channel currently registered for an application.
    #[must_use]
    pub fn all_channels(&self, app_id: &str) -> Vec<Arc<Channel>> {
        self.app_channels(app_id)
            .map(|channels| channels.iter().map(|c| Arc::clone(c.value())).collect())
            .unwrap_or_default()
    }

    /// Return the named channel, creating it if needed.
    ///
    /// The variant (public or private) is picked from the name prefix.
    pub fn find_or_create_channel(&self, app_id: &str, name: &str) -> Arc<Channel> {
        let app_channels = Arc::clone(&self.channels.entry(app_id.to_string()).or_default());

        let entry = app_channels.entry(name.to_string()).or_insert_with(|| {
            debug!(app_id = %app_id, channel = %name, "Creating new channel");
            Arc::new(Channel::new(name))
        });
        Arc::clone(entry.value())
    }

    /// Subscribe a connection to the channel named in `payload`.
    ///
    /// The channel is resolved in the connection's own application.
    pub fn subscribe_to_channel(
        &self,
        conn: &ConnectionHandle,
        payload: &SubscribePayload,
    ) -> SubscribeOutcome {
        let app_id = conn.app().id();
        let name = payload.channel.as_str();

        if let Err(reason) = validate_channel_name(name) {
            warn!(
                app_id = %app_id,
                socket_id = %conn.id(),
                channel = %name,
                reason,
                "Invalid channel name"
            );
            conn.send(&OutgoingMessage::error(reason, None));
            return SubscribeOutcome::Rejected;
        }

        let channel = self.find_or_create_channel(app_id, name);
        let outcome = channel.subscribe(conn, payload);

        if let SubscribeOutcome::Subscribed { occupied } = outcome {
            if occupied {
                dashboard::log_event(
                    self,
                    LogEventType::Occupied,
                    LogDetails::new(app_id).channel(name),
                );
            }
            dashboard::log_event(
                self,
                LogEventType::Subscribed,
                LogDetails::new(app_id)
                    .channel(name)
                    .connection(conn.id().as_str()),
            );
        }

        outcome
    }

    /// Unsubscribe a connection from one channel of its application.
    ///
    /// A channel that does not exist is logged and otherwise ignored.
    pub fn unsubscribe_from_channel(
        &self,
        conn: &ConnectionHandle,
        name: &str,
    ) -> UnsubscribeOutcome {
        let app_id = conn.app().id();

        let Some(channel) = self.find_channel(app_id, name) else {
            warn!(
                app_id = %app_id,
                socket_id = %conn.id(),
                channel = %name,
                "Unsubscribe from unknown channel"
            );
            return UnsubscribeOutcome::NotSubscribed;
        };

        let outcome = channel.unsubscribe(conn.id());
        if outcome == (UnsubscribeOutcome::Unsubscribed { vacated: true }) {
            self.log_vacated(app_id, name);
        }
        outcome
    }

    /// Remove a connection from every channel of its application.
    ///
    /// Returns the number of channels it was removed from.
    pub fn unsubscribe_from_all_channels(&self, conn: &ConnectionHandle) -> usize {
        let app_id = conn.app().id();
        let mut removed = 0;

        for channel in self.all_channels(app_id) {
            match channel.unsubscribe(conn.id()) {
                UnsubscribeOutcome::NotSubscribed => {}
                UnsubscribeOutcome::Unsubscribed { vacated } => {
                    removed += 1;
                    if vacated {
                        self.log_vacated(app_id, channel.name());
                    }
                }
            }
        }

        debug!(
            app_id = %app_id,
            socket_id = %conn.id(),
            channels = removed,
            "Unsubscribed from all channels"
        );
        removed
    }

    /// Number of distinct connections subscribed to any channel of an application.
    #[must_use]
    pub fn concurrent_connections_for_app(&self, app_id: &str) -> usize {
        let mut seen: HashSet<SocketId> = HashSet::new();
        for channel in self.all_channels(app_id) {
            seen.extend(channel.subscriber_ids());
        }
        seen.len()
    }

    /// Names of every channel registered for an application.
    #[must_use]
    pub fn channel_names(&self, app_id: &str) -> Vec<String> {
        self.all_channels(app_id)
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Get manager statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            app_count: self.channels.len(),
            ..Default::default()
        };
        for app in self.channels.iter() {
            for channel in app.value().iter() {
                let subscribers = channel.subscriber_count();
                stats.channel_count += 1;
                stats.total_subscriptions += subscribers;
                if subscribers > 0 {
                    stats.occupied_channels += 1;
                }
            }
        }
        stats
    }

    fn log_vacated(&self, app_id: &str, name: &str) {
        dashboard::log_event(
            self,
            LogEventType::Vacated,
            LogDetails::new(app_id).channel(name),
        );
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("apps", &self.channels.len())
            .finish()
    }
}

/// Channel manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Applications with at least one channel.
    pub app_count: usize,
    /// Channels across all applications, including empty ones.
    pub channel_count: usize,
    /// Channels with at least one subscriber.
    pub occupied_channels: usize,
    /// Sum of subscriber counts.
    pub total_subscriptions: usize,
}
