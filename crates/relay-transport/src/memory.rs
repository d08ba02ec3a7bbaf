//! In-memory socket halves.
//!
//! Used to drive sessions without a network: the [`MemoryPeer`] plays the
//! client, injecting inbound frames and observing what the server writes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{FrameReader, FrameWriter, TransportError, WireFrame};

/// Create a connected reader, writer and the peer driving them.
#[must_use]
pub fn pair() -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        MemoryReader {
            inbound: inbound_rx,
        },
        MemoryWriter {
            outbound: outbound_tx,
            closed: false,
        },
        MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
        },
    )
}

/// Reading half fed by the peer.
pub struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Result<WireFrame, TransportError>>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        self.inbound.recv().await.transpose()
    }
}

/// Writing half observed by the peer.
pub struct MemoryWriter {
    outbound: mpsc::UnboundedSender<WireFrame>,
    closed: bool,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            let _ = self.outbound.send(WireFrame::Close);
        }
        Ok(())
    }
}

/// The client side of an in-memory socket.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<WireFrame, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<WireFrame>,
}

impl MemoryPeer {
    /// Deliver a text frame to the server. Returns `false` once the reader is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.push(Ok(WireFrame::Text(text.into())))
    }

    /// Deliver an arbitrary frame or error to the server.
    pub fn push(&self, frame: Result<WireFrame, TransportError>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|inbound| inbound.send(frame).is_ok())
    }

    /// Hang up: the server's next read sees a clean end of stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Next frame the server wrote, or `None` once the writer is dropped.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.outbound.recv().await
    }

    /// Next text frame the server wrote, skipping control frames.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.outbound.recv().await? {
                WireFrame::Text(text) => return Some(text),
                WireFrame::Close => return None,
                _ => continue,
            }
        }
    }

    /// A frame the server already wrote, without waiting.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.outbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (mut reader, mut writer, mut peer) = pair();

        assert!(peer.send_text("hello"));
        assert_eq!(
            reader.recv().await.unwrap(),
            Some(WireFrame::Text("hello".to_string()))
        );

        writer.send(WireFrame::Text("world".to_string())).await.unwrap();
        assert_eq!(peer.recv_text().await.as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let (mut reader, _writer, mut peer) = pair();
        peer.disconnect();
        assert!(reader.recv().await.unwrap().is_none());
        assert!(!peer.send_text("late"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_reader, mut writer, mut peer) = pair();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(peer.recv().await, Some(WireFrame::Close));
        assert!(peer.try_recv().is_none());
        assert!(matches!(
            writer.send(WireFrame::Text("x".to_string())).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
