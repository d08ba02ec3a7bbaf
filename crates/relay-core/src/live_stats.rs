//! Statistics pushed to subscribers as they change.
//!
//! Two private channels per application carry `update` events:
//! `private-app-<id>-stats-concurrent-connections` on every connect and
//! disconnect, and `private-app-<id>-current-stats` once per reporting
//! window.

use std::time::{SystemTime, UNIX_EPOCH};

use relay_protocol::OutgoingMessage;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, trace};

use crate::channel_manager::ChannelManager;
use crate::stats::Statistic;

/// Event name of statistics updates.
pub const UPDATE_EVENT: &str = "update";

/// Channel receiving the connection count on every change.
#[must_use]
pub fn concurrent_connections_channel(app_id: &str) -> String {
    format!("private-app-{app_id}-stats-concurrent-connections")
}

/// Channel receiving the periodic statistics snapshot.
#[must_use]
pub fn current_stats_channel(app_id: &str) -> String {
    format!("private-app-{app_id}-current-stats")
}

#[derive(Serialize)]
struct ConcurrentConnections {
    concurrent_connections: usize,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    #[serde(flatten)]
    stat: &'a Statistic,
    timestamp: u64,
}

/// Publish an application's current connection count.
pub fn publish_concurrent_connections(channels: &ChannelManager, app_id: &str, count: usize) {
    let data = ConcurrentConnections {
        concurrent_connections: count,
    };
    publish(channels, app_id, &concurrent_connections_channel(app_id), &data);
}

/// Publish one reporting window's counters.
pub fn publish_statistic(channels: &ChannelManager, stat: &Statistic) {
    let data = Snapshot {
        stat,
        timestamp: now_secs(),
    };
    publish(channels, &stat.app_id, &current_stats_channel(&stat.app_id), &data);
}

/// Must not be called while holding a channel's subscriber lock.
fn publish<T: Serialize>(channels: &ChannelManager, app_id: &str, name: &str, data: &T) {
    let channel = channels.find_or_create_channel(app_id, name);
    if channel.is_empty() {
        return;
    }

    let data = match serde_json::to_string(data) {
        Ok(data) => data,
        Err(e) => {
            error!(app_id = %app_id, channel = %name, error = %e, "Failed to encode statistics");
            return;
        }
    };

    let message = OutgoingMessage::event(channel.name(), UPDATE_EVENT, Value::String(data));
    let recipients = channel.broadcast(&message);
    trace!(app_id = %app_id, channel = %name, recipients, "Statistics published");
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppRegistry, Application, StaticAppRegistry};
    use crate::auth;
    use crate::connection::ConnectionHandle;
    use bytes::Bytes;
    use relay_protocol::SubscribePayload;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn manager() -> (ChannelManager, Arc<Application>) {
        let registry = StaticAppRegistry::new([Application::new("7", "K7", "S7")]).unwrap();
        let app = registry.find_by_id("7").unwrap();
        (ChannelManager::new(Arc::new(registry)), app)
    }

    fn watch(
        channels: &ChannelManager,
        app: &Arc<Application>,
        name: &str,
    ) -> mpsc::Receiver<Bytes> {
        let (watcher, mut rx) = ConnectionHandle::channel("7.1".into(), app.clone(), 16);
        let token = auth::channel_token(app, "7.1", name, None).unwrap();
        channels.subscribe_to_channel(&watcher, &SubscribePayload::new(name).with_auth(token));
        while rx.try_recv().is_ok() {}
        rx
    }

    fn next_data(rx: &mut mpsc::Receiver<Bytes>, channel: &str) -> Value {
        let frame: Value = serde_json::from_slice(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["event"], UPDATE_EVENT);
        assert_eq!(frame["channel"], channel);
        serde_json::from_str(frame["data"].as_str().unwrap()).unwrap()
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(
            concurrent_connections_channel("7"),
            "private-app-7-stats-concurrent-connections"
        );
        assert_eq!(current_stats_channel("7"), "private-app-7-current-stats");
    }

    #[test]
    fn test_concurrent_connections_update() {
        let (channels, app) = manager();
        let name = concurrent_connections_channel("7");
        let mut rx = watch(&channels, &app, &name);

        publish_concurrent_connections(&channels, "7", 3);
        assert_eq!(next_data(&mut rx, &name), serde_json::json!({"concurrent_connections": 3}));
    }

    #[test]
    fn test_snapshot_carries_every_counter() {
        let (channels, app) = manager();
        let name = current_stats_channel("7");
        let mut rx = watch(&channels, &app, &name);

        let stat = Statistic {
            app_id: "7".to_string(),
            concurrent_connections: 2,
            peak_connections: 4,
            websocket_messages: 5,
            api_messages: 6,
        };
        publish_statistic(&channels, &stat);

        let data = next_data(&mut rx, &name);
        assert_eq!(data["app_id"], "7");
        assert_eq!(data["concurrent_connections"], 2);
        assert_eq!(data["peak_connections"], 4);
        assert_eq!(data["websocket_messages"], 5);
        assert_eq!(data["api_messages"], 6);
        assert!(data["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_nobody_listening() {
        let (channels, _) = manager();
        publish_concurrent_connections(&channels, "7", 1);
        let channel = channels
            .find_channel("7", &concurrent_connections_channel("7"))
            .unwrap();
        assert!(channel.is_empty());
    }
}
