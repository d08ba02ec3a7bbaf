//! Process-wide registry of live connections.
//!
//! The registry map is owned by a single actor task. Registration and
//! unregistration arrive on their own queues and are applied one at a time,
//! so the map is never touched concurrently. [`Hub`] is the cloneable handle
//! the rest of the process talks to.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::AppId;
use crate::channel_manager::ChannelManager;
use crate::connection::{ConnectionHandle, SocketId};
use crate::dashboard::{self, LogDetails, LogEventType};
use crate::live_stats;
use crate::stats::StatsSink;

/// Register queue depth.
const REGISTER_BUFFER: usize = 1024;

/// Hub errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The application already has as many connections as it allows.
    #[error("Over capacity: application {app_id} allows {capacity} connections")]
    OverCapacity { app_id: AppId, capacity: usize },

    /// The hub actor has stopped.
    #[error("Hub is closed")]
    Closed,
}

struct Register {
    conn: ConnectionHandle,
    respond_to: oneshot::Sender<Result<(), HubError>>,
}

enum Query {
    Contains {
        socket_id: SocketId,
        respond_to: oneshot::Sender<bool>,
    },
    ConnectionCount {
        respond_to: oneshot::Sender<usize>,
    },
    AppConnectionCount {
        app_id: AppId,
        respond_to: oneshot::Sender<usize>,
    },
}

/// Handle to the hub actor.
#[derive(Clone)]
pub struct Hub {
    register: mpsc::Sender<Register>,
    unregister: mpsc::UnboundedSender<ConnectionHandle>,
    query: mpsc::Sender<Query>,
    channels: Arc<ChannelManager>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Spawn the hub actor and return a handle to it.
    ///
    /// The actor runs until `shutdown` is cancelled or every handle is
    /// dropped. On shutdown it signals every registered connection to close.
    pub fn spawn(
        channels: Arc<ChannelManager>,
        stats: Arc<dyn StatsSink>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_BUFFER);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = mpsc::channel(REGISTER_BUFFER);

        let actor = HubActor {
            register: register_rx,
            unregister: unregister_rx,
            query: query_rx,
            connections: HashMap::new(),
            per_app: HashMap::new(),
            channels: Arc::clone(&channels),
            stats,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(actor.run());

        let hub = Self {
            register: register_tx,
            unregister: unregister_tx,
            query: query_tx,
            channels,
            shutdown,
        };
        (hub, task)
    }

    /// The channel manager teardown goes through.
    #[must_use]
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::OverCapacity`] if the application is full, or
    /// [`HubError::Closed`] if the hub has stopped.
    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.register
            .send(Register {
                conn,
                respond_to: tx,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    /// Queue a connection for removal from the registry.
    pub fn unregister(&self, conn: ConnectionHandle) {
        if self.unregister.send(conn).is_err() {
            debug!("Hub closed, dropping unregister");
        }
    }

    /// Tear a connection down.
    ///
    /// Unsubscribes it from every channel of its application, then
    /// unregisters it, then signals its session to release the socket. Only
    /// the first call for a connection does anything.
    pub fn remove_connection(&self, conn: &ConnectionHandle) {
        if !conn.mark_closed() {
            return;
        }

        self.channels.unsubscribe_from_all_channels(conn);
        self.unregister(conn.clone());
        conn.shutdown();
    }

    /// Whether a connection is currently registered.
    pub async fn contains(&self, socket_id: &SocketId) -> bool {
        let socket_id = socket_id.clone();
        self.ask(|respond_to| Query::Contains {
            socket_id,
            respond_to,
        })
        .await
        .unwrap_or(false)
    }

    /// Number of registered connections across all applications.
    pub async fn connection_count(&self) -> usize {
        self.ask(|respond_to| Query::ConnectionCount { respond_to })
            .await
            .unwrap_or(0)
    }

    /// Number of registered connections for one application.
    pub async fn app_connection_count(&self, app_id: &str) -> usize {
        let app_id = app_id.to_string();
        self.ask(|respond_to| Query::AppConnectionCount { app_id, respond_to })
            .await
            .unwrap_or(0)
    }

    /// Stop the actor.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn ask<T>(&self, query: impl FnOnce(oneshot::Sender<T>) -> Query) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.query.send(query(tx)).await.ok()?;
        rx.await.ok()
    }
}

struct HubActor {
    register: mpsc::Receiver<Register>,
    unregister: mpsc::UnboundedReceiver<ConnectionHandle>,
    query: mpsc::Receiver<Query>,
    connections: HashMap<SocketId, ConnectionHandle>,
    per_app: HashMap<AppId, usize>,
    channels: Arc<ChannelManager>,
    stats: Arc<dyn StatsSink>,
    shutdown: CancellationToken,
}

impl HubActor {
    async fn run(mut self) {
        info!("Hub started");

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                Some(conn) = self.unregister.recv() => self.handle_unregister(conn),

                msg = self.register.recv() => match msg {
                    Some(request) => self.answer_register(request),
                    None => break,
                },

                Some(query) = self.query.recv() => self.handle_query(query),
            }
        }

        for conn in self.connections.values() {
            conn.shutdown();
        }
        info!(connections = self.connections.len(), "Hub stopped");
    }

    fn answer_register(&mut self, Register { conn, respond_to }: Register) {
        let fresh = !self.connections.contains_key(conn.id());
        let result = self.handle_register(conn.clone());
        let registered = fresh && result.is_ok();

        // The caller gave up waiting, so nobody will ever unregister it.
        if respond_to.send(result).is_err() && registered {
            debug!(socket_id = %conn.id(), "Registrant gone, rolling back");
            self.handle_unregister(conn);
        }
    }

    fn handle_register(&mut self, conn: ConnectionHandle) -> Result<(), HubError> {
        let app = Arc::clone(conn.app());

        if self.connections.contains_key(conn.id()) {
            debug!(socket_id = %conn.id(), "Connection already registered");
            return Ok(());
        }

        let current = self.per_app.get(app.id()).copied().unwrap_or(0);
        if let Some(capacity) = app.capacity() {
            if current >= capacity {
                warn!(
                    app_id = %app.id(),
                    socket_id = %conn.id(),
                    capacity,
                    "Application over capacity"
                );
                return Err(HubError::OverCapacity {
                    app_id: app.id().to_string(),
                    capacity,
                });
            }
        }

        self.per_app.insert(app.id().to_string(), current + 1);
        self.connections.insert(conn.id().clone(), conn.clone());
        self.stats.on_connect(app.id());
        live_stats::publish_concurrent_connections(&self.channels, app.id(), current + 1);

        info!(app_id = %app.id(), socket_id = %conn.id(), "Connection registered");
        dashboard::log_event(
            &self.channels,
            LogEventType::Connected,
            LogDetails::new(app.id()).connection(conn.id().as_str()),
        );
        Ok(())
    }

    fn handle_unregister(&mut self, conn: ConnectionHandle) {
        if self.connections.remove(conn.id()).is_none() {
            return;
        }

        let app_id = conn.app().id();
        let remaining = match self.per_app.get_mut(app_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        self.stats.on_disconnect(app_id);
        live_stats::publish_concurrent_connections(&self.channels, app_id, remaining);

        info!(app_id = %app_id, socket_id = %conn.id(), "Connection unregistered");
        dashboard::log_event(
            &self.channels,
            LogEventType::Disconnected,
            LogDetails::new(app_id).connection(conn.id().as_str()),
        );
    }

    fn handle_query(&self, query: Query) {
        match query {
            Query::Contains {
                socket_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.connections.contains_key(&socket_id));
            }
            Query::ConnectionCount { respond_to } => {
                let _ = respond_to.send(self.connections.len());
            }
            Query::AppConnectionCount { app_id, respond_to } => {
                let count = self.per_app.get(&app_id).copied().unwrap_or(0);
                let _ = respond_to.send(count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppRegistry, Application, StaticAppRegistry};
    use crate::auth;
    use crate::channel::SubscribeOutcome;
    use crate::stats::MemoryStats;
    use bytes::Bytes;
    use relay_protocol::SubscribePayload;

    struct Fixture {
        hub: Hub,
        stats: Arc<MemoryStats>,
        channels: Arc<ChannelManager>,
    }

    fn fixture() -> Fixture {
        let registry = StaticAppRegistry::new([
            Application::new("1", "K1", "S1"),
            Application::new("2", "K2", "S2").with_capacity(2),
        ])
        .unwrap();
        let channels = Arc::new(ChannelManager::new(Arc::new(registry)));
        let stats = Arc::new(MemoryStats::new());
        let (hub, _task) = Hub::spawn(
            Arc::clone(&channels),
            stats.clone(),
            CancellationToken::new(),
        );
        Fixture {
            hub,
            stats,
            channels,
        }
    }

    fn connection(
        channels: &ChannelManager,
        app_id: &str,
        id: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<Bytes>) {
        let app = channels.app_registry().find_by_id(app_id).unwrap();
        ConnectionHandle::channel(id.into(), app, 32)
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let f = fixture();
        let (conn, _rx) = connection(&f.channels, "1", "1.1");

        f.hub.register(conn.clone()).await.unwrap();
        assert!(f.hub.contains(conn.id()).await);
        assert_eq!(f.hub.connection_count().await, 1);
        assert_eq!(f.stats.snapshot("1").concurrent_connections, 1);

        f.hub.unregister(conn.clone());
        assert!(!f.hub.contains(conn.id()).await);
        assert_eq!(f.hub.app_connection_count("1").await, 0);
        assert_eq!(f.stats.snapshot("1").concurrent_connections, 0);
    }

    #[tokio::test]
    async fn test_register_twice_counts_once() {
        let f = fixture();
        let (conn, _rx) = connection(&f.channels, "1", "1.1");

        f.hub.register(conn.clone()).await.unwrap();
        f.hub.register(conn.clone()).await.unwrap();
        assert_eq!(f.hub.app_connection_count("1").await, 1);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let f = fixture();
        let (a, _rx_a) = connection(&f.channels, "2", "2.1");
        let (b, _rx_b) = connection(&f.channels, "2", "2.2");
        let (c, _rx_c) = connection(&f.channels, "2", "2.3");

        f.hub.register(a.clone()).await.unwrap();
        f.hub.register(b).await.unwrap();
        assert_eq!(
            f.hub.register(c.clone()).await,
            Err(HubError::OverCapacity {
                app_id: "2".to_string(),
                capacity: 2
            })
        );
        assert!(!f.hub.contains(c.id()).await);

        // Leaving frees a slot.
        f.hub.remove_connection(&a);
        f.hub.register(c).await.unwrap();
        assert_eq!(f.hub.app_connection_count("2").await, 2);
    }

    #[tokio::test]
    async fn test_capacity_unlimited_by_default() {
        let f = fixture();
        let mut receivers = Vec::new();
        for i in 0..10 {
            let (conn, rx) = connection(&f.channels, "1", &format!("1.{i}"));
            f.hub.register(conn).await.unwrap();
            receivers.push(rx);
        }
        assert_eq!(f.hub.app_connection_count("1").await, 10);
    }

    #[tokio::test]
    async fn test_remove_connection_tears_down_everything() {
        let f = fixture();
        let (conn, _rx) = connection(&f.channels, "1", "1.1");
        f.hub.register(conn.clone()).await.unwrap();

        let token = auth::channel_token(conn.app(), "1.1", "private-room", None).unwrap();
        let private = SubscribePayload::new("private-room").with_auth(token);
        f.channels.subscribe_to_channel(&conn, &SubscribePayload::new("chat"));
        f.channels.subscribe_to_channel(&conn, &private);

        f.hub.remove_connection(&conn);

        for name in ["chat", "private-room"] {
            let channel = f.channels.find_channel("1", name).unwrap();
            assert!(!channel.is_subscribed(conn.id()), "{name}");
        }
        assert!(!f.hub.contains(conn.id()).await);
        assert!(conn.shutdown_token().is_cancelled());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_remove_connection_is_idempotent() {
        let f = fixture();
        let (conn, _rx) = connection(&f.channels, "1", "1.1");
        f.hub.register(conn.clone()).await.unwrap();

        f.hub.remove_connection(&conn);
        f.hub.remove_connection(&conn);
        f.hub.remove_connection(&conn);

        assert_eq!(f.hub.connection_count().await, 0);
        assert_eq!(f.stats.snapshot("1").concurrent_connections, 0);
        assert_eq!(f.stats.snapshot("1").peak_connections, 1);
    }

    #[tokio::test]
    async fn test_subscribe_after_teardown_is_refused() {
        let f = fixture();
        let (conn, _rx) = connection(&f.channels, "1", "1.1");
        f.hub.register(conn.clone()).await.unwrap();

        // A read pump still holding the handle loses the race with teardown.
        f.hub.remove_connection(&conn);
        assert_eq!(
            f.channels.subscribe_to_channel(&conn, &SubscribePayload::new("chat")),
            SubscribeOutcome::Rejected
        );

        f.hub.remove_connection(&conn);
        let channel = f.channels.find_channel("1", "chat").unwrap();
        assert!(!channel.is_subscribed(conn.id()));
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn test_register_rolled_back_when_caller_gone() {
        let f = fixture();
        let (conn, _rx) = connection(&f.channels, "2", "2.1");

        let (tx, rx) = oneshot::channel();
        drop(rx);
        f.hub
            .register
            .send(Register {
                conn: conn.clone(),
                respond_to: tx,
            })
            .await
            .unwrap();

        assert!(!f.hub.contains(conn.id()).await);
        assert_eq!(f.hub.app_connection_count("2").await, 0);
        assert_eq!(f.stats.snapshot("2").concurrent_connections, 0);
    }

    #[tokio::test]
    async fn test_connection_count_published() {
        let f = fixture();
        let (watcher, mut rx) = connection(&f.channels, "1", "1.1");
        f.hub.register(watcher.clone()).await.unwrap();

        let name = live_stats::concurrent_connections_channel("1");
        let token = auth::channel_token(watcher.app(), "1.1", &name, None).unwrap();
        let payload = SubscribePayload::new(name.clone()).with_auth(token);
        f.channels.subscribe_to_channel(&watcher, &payload);
        while rx.try_recv().is_ok() {}

        let (other, _other_rx) = connection(&f.channels, "1", "1.2");
        f.hub.register(other.clone()).await.unwrap();
        f.hub.unregister(other);
        assert_eq!(f.hub.connection_count().await, 1);

        let counts: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| serde_json::from_slice::<serde_json::Value>(&frame).unwrap())
            .filter(|frame| frame["channel"] == name.as_str())
            .map(|frame| {
                let data: serde_json::Value =
                    serde_json::from_str(frame["data"].as_str().unwrap()).unwrap();
                data["concurrent_connections"].as_u64().unwrap()
            })
            .collect();
        assert_eq!(counts, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let f = fixture();
        let (conn, _rx) = connection(&f.channels, "1", "1.1");
        f.hub.register(conn.clone()).await.unwrap();

        let shutdown = f.hub.shutdown.clone();
        f.hub.shutdown();
        shutdown.cancelled().await;
        conn.shutdown_token().cancelled().await;

        assert_eq!(
            f.hub.register(connection(&f.channels, "1", "1.2").0).await,
            Err(HubError::Closed)
        );
    }
}
