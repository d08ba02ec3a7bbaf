//! Live activity log for an application's dashboard.
//!
//! Entries are published as `log` events on the application's
//! `private-websockets-dashboard-<app id>` channel, so any client authorized
//! for that channel can watch connections and channels come and go.

use std::time::{SystemTime, UNIX_EPOCH};

use relay_protocol::OutgoingMessage;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, trace};

use crate::channel_manager::ChannelManager;

/// Prefix of the per-application dashboard channel.
pub const LOG_CHANNEL_PREFIX: &str = "private-websockets-dashboard-";

/// Event name of dashboard log entries.
pub const LOG_EVENT: &str = "log";

/// Kinds of dashboard entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventType {
    Connected,
    Disconnected,
    Occupied,
    Vacated,
    Subscribed,
    ApiMessage,
    ClientMessage,
}

/// Details attached to an entry.
#[derive(Debug, Clone, Default)]
pub struct LogDetails {
    pub app_id: String,
    pub channel_name: String,
    pub event_name: String,
    pub connection_id: String,
    pub payload: Option<Value>,
}

impl LogDetails {
    #[must_use]
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn channel(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = channel_name.into();
        self
    }

    #[must_use]
    pub fn event(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = event_name.into();
        self
    }

    #[must_use]
    pub fn connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Serialize)]
struct LogEntry<'a> {
    #[serde(rename = "type")]
    kind: LogEventType,
    time: u64,
    event_name: &'a str,
    channel_name: &'a str,
    connection_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
}

/// Name of the dashboard channel for an application.
#[must_use]
pub fn log_channel_name(app_id: &str) -> String {
    format!("{}{}", LOG_CHANNEL_PREFIX, app_id)
}

/// Publish an entry to the application's dashboard channel.
///
/// Must not be called while holding a channel's subscriber lock.
pub fn log_event(channels: &ChannelManager, kind: LogEventType, details: LogDetails) {
    if details.app_id.is_empty() {
        return;
    }

    let channel =
        channels.find_or_create_channel(&details.app_id, &log_channel_name(&details.app_id));
    if channel.is_empty() {
        return;
    }

    let entry = LogEntry {
        kind,
        time: now_millis(),
        event_name: &details.event_name,
        channel_name: &details.channel_name,
        connection_id: &details.connection_id,
        payload: details.payload.as_ref(),
    };
    let data = match serde_json::to_string(&entry) {
        Ok(data) => data,
        Err(e) => {
            error!(app_id = %details.app_id, error = %e, "Failed to encode dashboard entry");
            return;
        }
    };

    let message = OutgoingMessage::event(channel.name(), LOG_EVENT, Value::String(data));
    let recipients = channel.broadcast(&message);
    trace!(app_id = %details.app_id, ?kind, recipients, "Dashboard entry published");
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
