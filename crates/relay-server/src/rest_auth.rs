//! Signed REST requests.
//!
//! Every `/apps/:app_id/*` request carries an `auth_signature` query
//! parameter: the hex HMAC-SHA256, keyed by the application secret, of
//!
//! ```text
//! METHOD\nPATH\nk1=v1&k2=v2...
//! ```
//!
//! where the pairs are every other query parameter sorted by key.

use tenvis_relay_core::{auth, Application, AuthError};
use thiserror::Error;

/// Name of the query parameter holding the signature.
pub const SIGNATURE_PARAM: &str = "auth_signature";

/// REST signature failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RestAuthError {
    /// No `auth_signature` parameter.
    #[error("Missing auth_signature")]
    MissingSignature,

    /// The signature is not hex or does not match.
    #[error("Invalid auth_signature")]
    InvalidSignature(#[from] AuthError),
}

/// Build the string a request signature covers.
#[must_use]
pub fn string_to_sign(method: &str, path: &str, params: &[(String, String)]) -> String {
    let mut pairs: Vec<(&str, &str)> = params
        .iter()
        .filter(|(k, _)| k != SIGNATURE_PARAM)
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.sort_unstable();

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!("{}\n{}\n{}", method.to_ascii_uppercase(), path, query)
}

/// Verify the signature of a request made on behalf of `app`.
///
/// # Errors
///
/// Returns an error if the signature is absent, undecodable or wrong.
pub fn verify_request(
    app: &Application,
    method: &str,
    path: &str,
    params: &[(String, String)],
) -> Result<(), RestAuthError> {
    let signature = params
        .iter()
        .find(|(k, _)| k == SIGNATURE_PARAM)
        .map(|(_, v)| v.as_str())
        .ok_or(RestAuthError::MissingSignature)?;

    auth::verify(app.secret(), &string_to_sign(method, path, params), signature)?;
    Ok(())
}

/// Append a valid `auth_signature` to `params`.
///
/// # Errors
///
/// Returns an error if the application secret cannot key an HMAC.
pub fn sign_request(
    app: &Application,
    method: &str,
    path: &str,
    params: &mut Vec<(String, String)>,
) -> Result<(), AuthError> {
    params.retain(|(k, _)| k != SIGNATURE_PARAM);
    let signature = auth::sign(app.secret(), &string_to_sign(method, path, params))?;
    params.push((SIGNATURE_PARAM.to_string(), signature));
    Ok(())
}
