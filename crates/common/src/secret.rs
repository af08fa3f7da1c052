//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for signing keys, passwords and
//! bearer tokens, and adds the minimum-strength check applied to HMAC
//! signing secrets loaded from configuration.
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct NewAccount {
//!     email: String,
//!     password: SecretString,  // Debug shows "[REDACTED]"
//! }
//!
//! let req = NewAccount {
//!     email: "ada@example.com".to_string(),
//!     password: SecretString::from("hunter22"),
//! };
//! assert!(!format!("{req:?}").contains("hunter22"));
//! assert_eq!(req.password.expose_secret(), "hunter22");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

use thiserror::Error;

/// Minimum length in bytes of an HMAC signing secret.
pub const MIN_SIGNING_SECRET_BYTES: usize = 32;

/// A signing secret that failed the strength check.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigningSecretError {
    #[error("signing secret must be at least {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },
}

/// Wrap a raw configuration value as a signing secret.
///
/// # Errors
///
/// Returns [`SigningSecretError::TooShort`] when the value is shorter than
/// [`MIN_SIGNING_SECRET_BYTES`].
pub fn signing_secret(raw: &str) -> Result<SecretString, SigningSecretError> {
    if raw.len() < MIN_SIGNING_SECRET_BYTES {
        return Err(SigningSecretError::TooShort {
            min: MIN_SIGNING_SECRET_BYTES,
            actual: raw.len(),
        });
    }
    Ok(SecretString::from(raw.to_string()))
}
