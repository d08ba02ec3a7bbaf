//! Codec for encoding and decoding protocol messages.
//!
//! Messages are JSON text frames. Inbound frames are bounded by a maximum size
//! so a single client cannot make the server buffer arbitrary amounts of data.

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::frames::IncomingMessage;

/// Default maximum inbound frame size (100 KiB).
pub const MAX_FRAME_SIZE: usize = 100 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// The frame is not a valid message envelope.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The envelope is valid but its payload has the wrong shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// A channel event arrived without a channel.
    #[error("Missing channel")]
    MissingChannel,
}

/// Encode a message to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(message).map_err(ProtocolError::Encode)?;
    Ok(Bytes::from(payload))
}

/// Decode a message, enforcing [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the frame is too large or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<IncomingMessage, ProtocolError> {
    decode_with_limit(data, MAX_FRAME_SIZE)
}

/// Decode a message, enforcing a caller-supplied size limit.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a valid envelope.
pub fn decode_with_limit(data: &[u8], max: usize) -> Result<IncomingMessage, ProtocolError> {
    if data.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }

    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}
