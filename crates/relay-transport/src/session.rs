//! Per-connection session: registration, read pump, write pump, heartbeat.
//!
//! Each accepted socket gets two pumps. The write pump is the only code that
//! writes to the socket: it drains the connection's outbound queue and sends
//! a ping every [`SessionConfig::ping_period`]. The read pump decodes frames
//! and dispatches them one at a time; if nothing arrives within
//! [`SessionConfig::pong_wait`] the connection is considered dead. Whichever
//! pump stops first tears the connection down through the hub, which cancels
//! the other.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relay_protocol::{codec, ErrorCode, OutgoingMessage, ProtocolError, MAX_FRAME_SIZE};
use tenvis_relay_core::{Application, ConnectionHandle, Dispatcher, Hub, HubError, SocketId};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::traits::{FrameObserver, FrameReader, FrameWriter, NoopObserver, WireFrame};

/// Session timing and limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity interval advertised to clients, after which they should ping.
    pub activity_timeout: Duration,
    /// How long the read pump waits for any frame before giving up.
    pub pong_wait: Duration,
    /// Maximum time a single socket write may take.
    pub write_wait: Duration,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Capacity of the per-connection outbound queue.
    pub outbound_buffer: usize,
}

impl SessionConfig {
    /// Interval between server pings, 60% of the read deadline.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 6 / 10
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_secs(120),
            pong_wait: Duration::from_secs(120),
            write_wait: Duration::from_secs(10),
            max_message_size: MAX_FRAME_SIZE,
            outbound_buffer: 1024,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The hub refused the connection.
    Rejected,
    /// The peer closed the socket.
    Closed,
    /// Nothing was read within the read deadline.
    Timeout,
    /// A frame exceeded the size limit.
    FrameTooLarge,
    /// A read or write failed.
    TransportError,
    /// The connection was torn down from elsewhere.
    Shutdown,
}

/// Runs sessions for accepted sockets.
#[derive(Clone)]
pub struct Gateway {
    hub: Hub,
    dispatcher: Dispatcher,
    config: SessionConfig,
    observer: Arc<dyn FrameObserver>,
}

impl Gateway {
    #[must_use]
    pub fn new(hub: Hub, dispatcher: Dispatcher, config: SessionConfig) -> Self {
        Self {
            hub,
            dispatcher,
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Report frame traffic to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn FrameObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Serve one socket for `app` until it closes.
    ///
    /// Registers the connection, announces its socket id, then runs both
    /// pumps. Returns once the connection is fully torn down.
    pub async fn serve<R, W>(
        &self,
        app: Arc<Application>,
        reader: R,
        mut writer: W,
    ) -> SessionEnd
    where
        R: FrameReader + 'static,
        W: FrameWriter + 'static,
    {
        let socket_id = SocketId::generate();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let shutdown = CancellationToken::new();
        let conn = ConnectionHandle::new(socket_id, app, outbound_tx, shutdown);

        if let Err(e) = self.hub.register(conn.clone()).await {
            let code = match e {
                HubError::OverCapacity { .. } => Some(ErrorCode::OverCapacity),
                HubError::Closed => None,
            };
            let message = OutgoingMessage::error(e.to_string(), code);
            reject(&mut writer, &message, self.config.write_wait).await;
            return SessionEnd::Rejected;
        }

        let activity_timeout = self.config.activity_timeout.as_secs();
        conn.send(&OutgoingMessage::connection_established(
            conn.id().as_str(),
            activity_timeout,
        ));

        let write_pump = tokio::spawn(write_pump(
            writer,
            outbound_rx,
            conn.clone(),
            self.hub.clone(),
            self.config.clone(),
            Arc::clone(&self.observer),
        ));

        let end = self.read_pump(reader, &conn).await;
        self.hub.remove_connection(&conn);

        let end = match write_pump.await {
            Ok(Some(write_end)) if end == SessionEnd::Shutdown => write_end,
            Ok(_) => end,
            Err(e) => {
                error!(socket_id = %conn.id(), error = %e, "Write pump panicked");
                end
            }
        };

        info!(
            app_id = %conn.app().id(),
            socket_id = %conn.id(),
            reason = ?end,
            "Connection closed"
        );
        end
    }

    async fn read_pump<R: FrameReader>(
        &self,
        mut reader: R,
        conn: &ConnectionHandle,
    ) -> SessionEnd {
        let shutdown = conn.shutdown_token().clone();
        let pong_wait = self.config.pong_wait;

        loop {
            // Every received frame, data or control, restarts the deadline.
            let next = tokio::select! {
                () = shutdown.cancelled() => return SessionEnd::Shutdown,
                next = time::timeout(pong_wait, reader.recv()) => next,
            };

            let frame = match next {
                Err(_) => {
                    info!(socket_id = %conn.id(), "Read deadline exceeded");
                    self.observer.on_error("timeout");
                    return SessionEnd::Timeout;
                }
                Ok(Err(e)) => {
                    warn!(socket_id = %conn.id(), error = %e, "Read failed");
                    self.observer.on_error("read");
                    return SessionEnd::TransportError;
                }
                Ok(Ok(None)) | Ok(Ok(Some(WireFrame::Close))) => return SessionEnd::Closed,
                Ok(Ok(Some(frame))) => frame,
            };

            let data = match frame {
                WireFrame::Text(text) => Bytes::from(text),
                WireFrame::Binary(data) => data,
                WireFrame::Ping(_) | WireFrame::Pong(_) => {
                    trace!(socket_id = %conn.id(), "Control frame");
                    continue;
                }
                WireFrame::Close => return SessionEnd::Closed,
            };

            self.observer.on_inbound(data.len());
            match codec::decode_with_limit(&data, self.config.max_message_size) {
                Ok(message) => {
                    if let Err(e) = self.dispatcher.dispatch(conn, message) {
                        warn!(socket_id = %conn.id(), error = %e, "Dropping malformed message");
                    }
                }
                Err(ProtocolError::FrameTooLarge { size, max }) => {
                    warn!(socket_id = %conn.id(), size, max, "Frame too large");
                    self.observer.on_error("frame_too_large");
                    return SessionEnd::FrameTooLarge;
                }
                Err(e) => {
                    warn!(socket_id = %conn.id(), error = %e, "Dropping undecodable frame");
                }
            }
        }
    }
}

async fn write_pump<W: FrameWriter>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Bytes>,
    conn: ConnectionHandle,
    hub: Hub,
    config: SessionConfig,
    observer: Arc<dyn FrameObserver>,
) -> Option<SessionEnd> {
    let shutdown = conn.shutdown_token().clone();
    let period = config.ping_period();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failure = loop {
        let frame = tokio::select! {
            biased;

            () = shutdown.cancelled() => break None,

            bytes = outbound.recv() => match bytes {
                Some(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => WireFrame::Text(text),
                    Err(e) => {
                        error!(socket_id = %conn.id(), error = %e, "Outbound frame not UTF-8");
                        continue;
                    }
                },
                None => break None,
            },

            _ = ticker.tick() => WireFrame::Ping(Bytes::new()),
        };

        let len = frame.len();
        match time::timeout(config.write_wait, writer.send(frame)).await {
            Ok(Ok(())) => {
                if len > 0 {
                    observer.on_outbound(len);
                }
            }
            Ok(Err(e)) => {
                warn!(socket_id = %conn.id(), error = %e, "Write failed");
                observer.on_error("write");
                break Some(SessionEnd::TransportError);
            }
            Err(_) => {
                warn!(socket_id = %conn.id(), "Write deadline exceeded");
                observer.on_error("write_timeout");
                break Some(SessionEnd::Timeout);
            }
        }
    };

    hub.remove_connection(&conn);
    if time::timeout(config.write_wait, writer.close()).await.is_err() {
        debug!(socket_id = %conn.id(), "Close did not complete");
    }
    failure
}

/// Send a final error frame and close the socket.
pub async fn reject<W: FrameWriter>(
    writer: &mut W,
    message: &OutgoingMessage,
    write_wait: Duration,
) {
    match codec::encode(message) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            match time::timeout(write_wait, writer.send(WireFrame::Text(text))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Rejection write failed"),
                Err(_) => debug!("Rejection write timed out"),
            }
        }
        Err(e) => error!(error = %e, "Failed to encode rejection"),
    }
    let _ = time::timeout(write_wait, writer.close()).await;
}
