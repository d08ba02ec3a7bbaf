//! Connection identity and the handle used to reach a connection.
//!
//! The socket itself is owned by the transport session. Everything else in
//! the core (channels, the hub, the dispatcher) only ever holds a
//! [`ConnectionHandle`], which queues encoded frames for the session's write
//! pump and can signal the session to shut down.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use relay_protocol::codec;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use crate::app::Application;

/// Process-wide sequence for the first half of socket ids.
static SOCKET_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Server-assigned connection identifier in the `<digits>.<digits>` format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(String);

impl SocketId {
    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id.
    ///
    /// The sequence half keeps ids unique within the process, the random half
    /// keeps them from being predicted by other clients.
    #[must_use]
    pub fn generate() -> Self {
        let sequence = SOCKET_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
        Self(format!("{}.{}", sequence, salt))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SocketId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for SocketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SocketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

struct HandleInner {
    id: SocketId,
    app: Arc<Application>,
    outbound: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// A cheap, cloneable reference to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Create a handle around an outbound queue.
    #[must_use]
    pub fn new(
        id: SocketId,
        app: Arc<Application>,
        outbound: mpsc::Sender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                app,
                outbound,
                shutdown,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a handle together with the receiving end of its outbound queue.
    #[must_use]
    pub fn channel(
        id: SocketId,
        app: Arc<Application>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, app, tx, CancellationToken::new()), rx)
    }

    #[must_use]
    pub fn id(&self) -> &SocketId {
        &self.inner.id
    }

    /// The application this connection was opened for.
    #[must_use]
    pub fn app(&self) -> &Arc<Application> {
        &self.inner.app
    }

    /// Serialize a message and queue it for the write pump.
    ///
    /// Never blocks. Serialization failures and full or closed queues are
    /// logged and the message is dropped. Returns whether it was queued.
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        match codec::encode(message) {
            Ok(bytes) => self.send_raw(bytes),
            Err(e) => {
                error!(socket_id = %self.inner.id, error = %e, "Failed to encode outbound message");
                false
            }
        }
    }

    /// Queue an already-encoded frame for the write pump.
    pub fn send_raw(&self, bytes: Bytes) -> bool {
        match self.inner.outbound.try_send(bytes) {
            Ok(()) => {
                trace!(socket_id = %self.inner.id, "Queued outbound message");
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(socket_id = %self.inner.id, "Outbound queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!(socket_id = %self.inner.id, "Outbound queue closed, dropping message");
                false
            }
        }
    }

    /// Token cancelled when the connection is torn down.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Signal the session owning the socket to stop both pumps.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Mark the connection as closing.
    ///
    /// Returns `true` only for the first caller, so teardown runs once.
    pub fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("app_id", &self.inner.app.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::OutgoingMessage;

    fn app() -> Arc<Application> {
        Arc::new(Application::new("1", "key", "secret"))
    }

    #[test]
    fn test_socket_id_generation() {
        let id1 = SocketId::generate();
        let id2 = SocketId::generate();
        assert_ne!(id1, id2);

        let (seq, salt) = id1.as_str().split_once('.').unwrap();
        assert!(seq.chars().all(|c| c.is_ascii_digit()));
        assert!(salt.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_socket_id_from_string() {
        let id: SocketId = "123.456".into();
        assert_eq!(id.as_str(), "123.456");
        assert_eq!(id.to_string(), "123.456");
    }

    #[test]
    fn test_send_encodes_json() {
        let (handle, mut rx) = ConnectionHandle::channel("1.1".into(), app(), 4);
        assert!(handle.send(&OutgoingMessage::pong()));

        let bytes = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["event"], "pusher:pong");
    }

    #[test]
    fn test_send_drops_when_full() {
        let (handle, mut rx) = ConnectionHandle::channel("1.1".into(), app(), 1);
        assert!(handle.send(&OutgoingMessage::pong()));
        assert!(!handle.send(&OutgoingMessage::pong()));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (handle, rx) = ConnectionHandle::channel("1.1".into(), app(), 4);
        drop(rx);
        assert!(!handle.send(&OutgoingMessage::pong()));
    }

    #[test]
    fn test_mark_closed_once() {
        let (handle, _rx) = ConnectionHandle::channel("1.1".into(), app(), 4);
        let clone = handle.clone();

        assert!(!handle.is_closed());
        assert!(handle.mark_closed());
        assert!(!clone.mark_closed());
        assert!(clone.is_closed());
    }

    #[test]
    fn test_shutdown_cancels_token() {
        let (handle, _rx) = ConnectionHandle::channel("1.1".into(), app(), 4);
        assert!(!handle.shutdown_token().is_cancelled());
        handle.shutdown();
        assert!(handle.shutdown_token().is_cancelled());
    }
}
