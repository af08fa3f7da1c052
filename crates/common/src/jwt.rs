//! JWT utilities shared by the invitation codec and session validation.
//!
//! - Size limits checked before any parsing
//! - Clock skew constants for `iat` validation
//! - Unverified payload decoding for display-only use
//!
//! # Security
//!
//! [`decode_unverified_payload`] trusts nothing. Its output may only be used
//! for UX (for example "this link expired on ..."), never for authorization.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Tokens larger than this are rejected before base64 decoding or signature
/// verification. Invitation tokens are ~250 bytes.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default JWT clock skew tolerance (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum allowed JWT clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Structural failures detected before or without signature verification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("token exceeds maximum size")]
    TokenTooLarge,

    /// Token is not a three-part base64url JWT with a JSON payload.
    #[error("token is malformed")]
    MalformedToken,

    /// Token `iat` claim is too far in the future.
    #[error("token issued-at is in the future")]
    IatTooFarInFuture,
}

// =============================================================================
// Functions
// =============================================================================

/// Reject tokens above [`MAX_JWT_SIZE_BYTES`].
///
/// # Errors
///
/// Returns `TokenTooLarge` for oversized input.
pub fn check_size(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }
    Ok(())
}

/// Decode the payload segment of a JWT without verifying its signature.
///
/// Succeeds on expired or wrongly-signed tokens as long as the token is
/// structurally a JWT whose payload deserializes into `T`.
///
/// # Errors
///
/// - `TokenTooLarge` - token exceeds the size limit
/// - `MalformedToken` - wrong number of segments, bad base64, or payload not `T`
pub fn decode_unverified_payload<T: DeserializeOwned>(token: &str) -> Result<T, JwtValidationError> {
    check_size(token)?;

    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(JwtValidationError::MalformedToken);
    };

    if header.is_empty() || signature.is_empty() {
        return Err(JwtValidationError::MalformedToken);
    }

    let payload_bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT payload base64");
        JwtValidationError::MalformedToken
    })?;

    serde_json::from_slice(&payload_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT payload JSON");
        JwtValidationError::MalformedToken
    })
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `IatTooFarInFuture` if `iat` is more than `clock_skew` ahead of now.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
///
/// # Errors
///
/// Returns `IatTooFarInFuture` if `iat` is more than `clock_skew` ahead of `now`.
pub fn validate_iat_at(iat: i64, clock_skew: Duration, now: i64) -> Result<(), JwtValidationError> {
    // clock_skew is bounded to MAX_CLOCK_SKEW by configuration
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
