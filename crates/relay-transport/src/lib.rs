//! # relay-transport
//!
//! Socket abstraction and connection sessions for the Relay broker.
//!
//! A socket is consumed as two halves:
//!
//! - **FrameReader** - owned by the read pump, which decodes and dispatches
//! - **FrameWriter** - owned by the write pump, the only writer to the socket
//!
//! [`Gateway::serve`] registers a connection with the hub, runs both pumps
//! with heartbeats, and tears everything down when either side stops.
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{websocket, Gateway};
//!
//! async fn on_upgrade(gateway: Gateway, app: Arc<Application>, socket: WebSocket) {
//!     let (reader, writer) = websocket::split(socket);
//!     gateway.serve(app, reader, writer).await;
//! }
//! ```

pub mod memory;
pub mod session;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use session::{reject, Gateway, SessionConfig, SessionEnd};
pub use traits::{
    FrameObserver, FrameReader, FrameWriter, NoopObserver, TransportError, WireFrame,
};
