//! # relay-core
//!
//! Core types and message routing for the Relay broker.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Application** - Tenant registry (id, key, secret, limits)
//! - **Channel** - Public and private subscriber sets with fan-out
//! - **ChannelManager** - Per-application channel registry
//! - **Hub** - Serialized registry of live connections and teardown
//! - **Dispatcher** - Routing of inbound protocol frames
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌────────────────┐     ┌─────────┐
//! │  Connection │────▶│ Dispatcher  │────▶│ ChannelManager │────▶│ Channel │
//! └─────────────┘     └─────────────┘     └────────────────┘     └─────────┘
//!        │                                        ▲
//!        ▼                                        │
//! ┌─────────────┐                                 │
//! │     Hub     │─────────── teardown ────────────┘
//! └─────────────┘
//! ```

pub mod app;
pub mod auth;
pub mod channel;
pub mod channel_manager;
pub mod connection;
pub mod dashboard;
pub mod dispatcher;
pub mod hub;
pub mod live_stats;
pub mod message;
pub mod stats;

pub use app::{AppId, AppRegistry, AppRegistryError, Application, StaticAppRegistry};
pub use auth::AuthError;
pub use channel::{Channel, ChannelId, ChannelKind, SubscribeOutcome, UnsubscribeOutcome};
pub use channel_manager::{ChannelManager, ManagerStats};
pub use connection::{ConnectionHandle, SocketId};
pub use dispatcher::{Dispatcher, RelayRefusal};
pub use hub::{Hub, HubError};
pub use message::{ClientEvent, PusherMessage};
pub use stats::{MemoryStats, Statistic, StatsSink};
