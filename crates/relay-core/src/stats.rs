//! Per-application usage statistics.
//!
//! The core only ever notifies a [`StatsSink`]; aggregation, export and
//! persistence belong to whoever implements it.

use dashmap::DashMap;
use serde::Serialize;

use crate::app::AppId;

/// Receiver of usage notifications.
pub trait StatsSink: Send + Sync {
    /// A connection was registered.
    fn on_connect(&self, app_id: &str);

    /// A registered connection was removed.
    fn on_disconnect(&self, app_id: &str);

    /// An event was triggered through the HTTP API.
    fn on_api_message(&self, app_id: &str);

    /// A client event was relayed over a WebSocket.
    fn on_websocket_message(&self, app_id: &str);
}

/// Counters for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistic {
    pub app_id: AppId,
    pub concurrent_connections: u64,
    pub peak_connections: u64,
    pub websocket_messages: u64,
    pub api_messages: u64,
}

impl Statistic {
    fn new(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            ..Default::default()
        }
    }

    /// No connection was open at any point of the window.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.concurrent_connections == 0 && self.peak_connections == 0
    }
}

/// In-memory statistics, one entry per application.
#[derive(Debug, Default)]
pub struct MemoryStats {
    apps: DashMap<AppId, Statistic>,
}

impl MemoryStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counters for an application (zeroed if never seen).
    #[must_use]
    pub fn snapshot(&self, app_id: &str) -> Statistic {
        self.apps
            .get(app_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| Statistic::new(app_id))
    }

    /// Counters for every application seen so far.
    #[must_use]
    pub fn all(&self) -> Vec<Statistic> {
        self.apps.iter().map(|s| s.value().clone()).collect()
    }

    /// Start a new reporting window.
    ///
    /// Message counters are zeroed and the peak collapses to `current`.
    pub fn reset(&self, app_id: &str, current: u64) {
        let mut stat = self
            .apps
            .entry(app_id.to_string())
            .or_insert_with(|| Statistic::new(app_id));
        stat.concurrent_connections = current;
        stat.peak_connections = current;
        stat.websocket_messages = 0;
        stat.api_messages = 0;
    }

    /// Close the current reporting window.
    ///
    /// Idle applications are forgotten. Every other application's counters
    /// are returned and a new window is started with `current(app_id)` open
    /// connections.
    pub fn flush(&self, current: impl Fn(&str) -> u64) -> Vec<Statistic> {
        self.apps.retain(|_, stat| !stat.is_idle());
        let snapshot = self.all();
        for stat in &snapshot {
            self.reset(&stat.app_id, current(&stat.app_id));
        }
        snapshot
    }

    fn update(&self, app_id: &str, f: impl FnOnce(&mut Statistic)) {
        let mut stat = self
            .apps
            .entry(app_id.to_string())
            .or_insert_with(|| Statistic::new(app_id));
        f(&mut stat);
    }
}

impl StatsSink for MemoryStats {
    fn on_connect(&self, app_id: &str) {
        self.update(app_id, |s| {
            s.concurrent_connections += 1;
            s.peak_connections = s.peak_connections.max(s.concurrent_connections);
        });
    }

    fn on_disconnect(&self, app_id: &str) {
        self.update(app_id, |s| {
            s.concurrent_connections = s.concurrent_connections.saturating_sub(1);
        });
    }

    fn on_api_message(&self, app_id: &str) {
        self.update(app_id, |s| s.api_messages += 1);
    }

    fn on_websocket_message(&self, app_id: &str) {
        self.update(app_id, |s| s.websocket_messages += 1);
    }
}
