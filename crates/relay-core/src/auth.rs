//! HMAC-SHA256 signatures for private channel authorization.
//!
//! An application server authorizes a socket for a private channel by signing
//! `<socket_id>:<channel>` (plus `:<channel_data>` when present) with the
//! application secret. The client presents the result as `<key>:<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::app::Application;

type HmacSha256 = Hmac<Sha256>;

/// Authorization failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No authorization token was supplied.
    #[error("Missing auth token")]
    MissingToken,

    /// The token is not of the form `<key>:<hex signature>`.
    #[error("Malformed auth token")]
    MalformedToken,

    /// The signature does not match.
    #[error("Invalid auth signature")]
    InvalidSignature,

    /// The secret could not be used as an HMAC key.
    #[error("Invalid signing key")]
    InvalidKey,
}

/// Build the canonical string signed for a private channel subscription.
#[must_use]
pub fn signing_string(socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
    match channel_data.filter(|data| !data.is_empty()) {
        Some(data) => format!("{}:{}:{}", socket_id, channel, data),
        None => format!("{}:{}", socket_id, channel),
    }
}

/// Compute the raw HMAC-SHA256 of `message` keyed by `secret`.
///
/// # Errors
///
/// Returns [`AuthError::InvalidKey`] if the key is rejected.
pub fn sign_bytes(secret: &str, message: &str) -> Result<Vec<u8>, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compute the hex-encoded HMAC-SHA256 of `message` keyed by `secret`.
///
/// # Errors
///
/// Returns [`AuthError::InvalidKey`] if the key is rejected.
pub fn sign(secret: &str, message: &str) -> Result<String, AuthError> {
    sign_bytes(secret, message).map(hex::encode)
}

/// Verify a hex-encoded signature in constant time.
///
/// # Errors
///
/// Returns an error if the signature is not hex or does not match.
pub fn verify(secret: &str, message: &str, signature_hex: &str) -> Result<(), AuthError> {
    let supplied = hex::decode(signature_hex).map_err(|_| AuthError::MalformedToken)?;
    let expected = sign_bytes(secret, message)?;

    if constant_time_compare(&expected, &supplied) {
        Ok(())
    } else {
        Err(AuthError::InvalidSignature)
    }
}

/// Verify a `<key>:<hex signature>` token against `message`.
///
/// # Errors
///
/// Returns an error if the token is missing, malformed, or does not match.
pub fn verify_token(secret: &str, token: &str, message: &str) -> Result<(), AuthError> {
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    let (_, signature) = token.split_once(':').ok_or(AuthError::MalformedToken)?;
    verify(secret, message, signature)
}

/// Produce the token a client presents to subscribe `socket_id` to `channel`.
///
/// # Errors
///
/// Returns [`AuthError::InvalidKey`] if the application secret is rejected.
pub fn channel_token(
    app: &Application,
    socket_id: &str,
    channel: &str,
    channel_data: Option<&str>,
) -> Result<String, AuthError> {
    let signature = sign(app.secret(), &signing_string(socket_id, channel, channel_data))?;
    Ok(format!("{}:{}", app.key(), signature))
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_string() {
        assert_eq!(signing_string("1.2", "private-a", None), "1.2:private-a");
        assert_eq!(signing_string("1.2", "private-a", Some("")), "1.2:private-a");
        assert_eq!(
            signing_string("1.2", "private-a", Some(r#"{"user_id":1}"#)),
            r#"1.2:private-a:{"user_id":1}"#
        );
    }

    #[test]
    fn test_known_vector() {
        // Worked example from the protocol's authentication reference.
        let signature = sign("7ad3773142a6692b25b8", "1234.1234:private-foobar").unwrap();
        assert_eq!(
            signature,
            "58df8b0c36d6982b82c3ecf6b4662e34fe8c25bba48f5369f135bf843651c3a4"
        );
    }

    #[test]
    fn test_verify_token() {
        let app = Application::new("1", "K1", "S1");
        let token = channel_token(&app, "1.2", "private-room", None).unwrap();
        assert!(token.starts_with("K1:"));

        let message = signing_string("1.2", "private-room", None);
        assert_eq!(verify_token("S1", &token, &message), Ok(()));
        assert_eq!(
            verify_token("S2", &token, &message),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_token_bound_to_socket_and_channel() {
        let app = Application::new("1", "K1", "S1");
        let token = channel_token(&app, "1.2", "private-room", None).unwrap();

        let other_socket = signing_string("1.3", "private-room", None);
        let other_channel = signing_string("1.2", "private-lobby", None);
        assert!(verify_token("S1", &token, &other_socket).is_err());
        assert!(verify_token("S1", &token, &other_channel).is_err());
    }

    #[test]
    fn test_malformed_tokens() {
        let message = signing_string("1.2", "private-room", None);
        assert_eq!(verify_token("S1", "", &message), Err(AuthError::MissingToken));
        assert_eq!(
            verify_token("S1", "no-colon", &message),
            Err(AuthError::MalformedToken)
        );
        assert_eq!(
            verify_token("S1", "K1:not-hex", &message),
            Err(AuthError::MalformedToken)
        );
        assert_eq!(
            verify_token("S1", "K1:abcd", &message),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_any_bit_flip_is_rejected() {
        let message = signing_string("1.2", "private-room", Some("data"));
        let mut signature = sign_bytes("S1", &message).unwrap();

        for byte in 0..signature.len() {
            for bit in 0..8 {
                signature[byte] ^= 1 << bit;
                let token = format!("K1:{}", hex::encode(&signature));
                assert_eq!(
                    verify_token("S1", &token, &message),
                    Err(AuthError::InvalidSignature)
                );
                signature[byte] ^= 1 << bit;
            }
        }

        let token = format!("K1:{}", hex::encode(&signature));
        assert_eq!(verify_token("S1", &token, &message), Ok(()));
    }
}
