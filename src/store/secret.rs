//! Reversible encoding for stored mail passwords.
//!
//! The bridge has to present passwords back to the mail servers, so they are
//! only base64-encoded at rest. This is obfuscation, not protection.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use secrecy::{ExposeSecret, SecretString};

use crate::error::DatabaseError;

/// Encode a secret for the `secret` column.
pub fn encode_secret(secret: &SecretString) -> String {
    BASE64_STD.encode(secret.expose_secret().as_bytes())
}

/// Decode a value read from the `secret` column.
pub fn decode_secret(stored: &str) -> Result<SecretString, DatabaseError> {
    let bytes = BASE64_STD
        .decode(stored.trim())
        .map_err(|e| DatabaseError::Serialization(format!("secret is not base64: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| DatabaseError::Serialization(format!("secret is not UTF-8: {e}")))?;
    Ok(SecretString::from(text))
}
