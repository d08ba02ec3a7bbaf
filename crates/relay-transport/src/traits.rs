//! Transport abstraction traits for Relay.
//!
//! A socket is split into a reading half and a writing half so the read pump
//! and the write pump can each own one. Any transport that can produce these
//! halves can be served.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A frame as seen on the socket, below the protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// A text frame carrying one JSON envelope.
    Text(String),
    /// A binary frame. Treated like text if it holds UTF-8 JSON.
    Binary(Bytes),
    /// Transport-level liveness probe.
    Ping(Bytes),
    /// Reply to a liveness probe.
    Pong(Bytes),
    /// The peer is closing.
    Close,
}

impl WireFrame {
    /// Payload length, zero for control frames.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
            WireFrame::Ping(_) | WireFrame::Pong(_) | WireFrame::Close => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The reading half of a socket.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// The writing half of a socket.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send a frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Close the socket. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Hooks for per-frame accounting.
///
/// All methods default to doing nothing.
pub trait FrameObserver: Send + Sync {
    /// A data frame of `bytes` length was read.
    fn on_inbound(&self, _bytes: usize) {}

    /// A data frame of `bytes` length was written.
    fn on_outbound(&self, _bytes: usize) {}

    /// A session ended because of an error of the given kind.
    fn on_error(&self, _kind: &'static str) {}
}

/// Observer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FrameObserver for NoopObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_frame_len() {
        assert_eq!(WireFrame::Text("abc".to_string()).len(), 3);
        assert_eq!(WireFrame::Binary(Bytes::from_static(b"ab")).len(), 2);
        assert!(WireFrame::Ping(Bytes::from_static(b"xyz")).is_empty());
        assert!(WireFrame::Close.is_empty());
    }
}
