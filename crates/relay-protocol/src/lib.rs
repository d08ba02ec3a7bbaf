//! # relay-protocol
//!
//! Wire protocol definitions for the Relay realtime broker.
//!
//! Relay speaks the Pusher Channels protocol: JSON text frames carrying an
//! `event` name and an opaque `data` payload.
//!
//! ## Event families
//!
//! - `pusher:*` - Connection and subscription control
//! - `pusher_internal:*` - Server acknowledgments
//! - `client-*` - Events relayed between clients on private channels
//! - anything else - Application events triggered through the REST API
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, OutgoingMessage, SubscribePayload};
//!
//! let incoming = codec::decode(br#"{"event":"pusher:subscribe","data":{"channel":"chat"}}"#).unwrap();
//! let payload: SubscribePayload = incoming.payload().unwrap();
//! assert_eq!(payload.channel, "chat");
//!
//! let reply = codec::encode(&OutgoingMessage::subscription_succeeded("chat")).unwrap();
//! assert!(!reply.is_empty());
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, decode_with_limit, encode, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{
    events, ConnectionEstablished, ErrorCode, ErrorData, IncomingMessage, OutgoingMessage,
    SubscribePayload, UnsubscribePayload,
};
pub use version::{Version, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
