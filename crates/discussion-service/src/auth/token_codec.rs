//! Signed invitation tokens.
//!
//! A token is an HS256 JWT over `INVITATION_SIGNING_SECRET` carrying the
//! target discussion, a fixed purpose tag, `iat`, `exp` and a random `jti`.
//! The codec is stateless; revocation is the registry's job.
//!
//! # Security
//!
//! - Tokens are size-checked before any decoding
//! - Signature is verified before any claim is trusted
//! - Each rejection maps to a distinct [`TokenFault`] or `TokenExpired`
//! - Token values are never logged

use crate::config::Config;
use crate::errors::{DsError, TokenFault};
use crate::observability::metrics;
use chrono::{DateTime, TimeZone, Utc};
use common::jwt::{check_size, decode_unverified_payload, JwtValidationError};
use common::secret::{ExposeSecret, SecretString};
use common::types::DiscussionId;
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::instrument;

/// Purpose tag embedded in every invitation token.
pub const INVITATION_PURPOSE: &str = "participant_invitation";

/// Claims as they appear on the wire.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    discussion_id: Option<DiscussionId>,
    #[serde(default)]
    purpose: String,
    iat: i64,
    exp: i64,
    #[serde(default)]
    jti: String,
}

/// Claims of a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenClaims {
    pub discussion_id: DiscussionId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Unverified view of a token, for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPeek {
    pub discussion_id: Option<DiscussionId>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeekClaims {
    #[serde(default)]
    discussion_id: Option<DiscussionId>,
    exp: i64,
}

/// A freshly issued token.
#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Bounds on invitation lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub min: Duration,
    pub max: Duration,
    pub default: Duration,
}

impl TtlPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min: Duration::from_secs(config.invitation_min_ttl_seconds),
            max: Duration::from_secs(config.invitation_max_ttl_seconds),
            default: Duration::from_secs(config.invitation_default_ttl_seconds),
        }
    }

    /// Resolve a requested TTL, falling back to the default.
    ///
    /// # Errors
    ///
    /// `BadRequest` if the TTL lies outside `[min, max]`.
    pub fn resolve(&self, requested: Option<Duration>) -> Result<Duration, DsError> {
        let ttl = requested.unwrap_or(self.default);
        if ttl < self.min || ttl > self.max {
            return Err(DsError::BadRequest(format!(
                "Invitation lifetime must be between {}s and {}s",
                self.min.as_secs(),
                self.max.as_secs()
            )));
        }
        Ok(ttl)
    }
}

/// Issues and verifies invitation tokens.
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    policy: TtlPolicy,
    rng: SystemRandom,
}

impl TokenCodec {
    pub fn new(secret: &SecretString, policy: TtlPolicy) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(bytes),
            decoding_key: DecodingKey::from_secret(bytes),
            policy,
            rng: SystemRandom::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.invitation_signing_secret,
            TtlPolicy::from_config(config),
        )
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Issue a token for `discussion_id` valid for `ttl` (or the default).
    ///
    /// # Errors
    ///
    /// - `BadRequest` - TTL outside policy
    /// - `Internal` - RNG or signing failure
    pub fn issue(&self, discussion_id: DiscussionId, ttl: Option<Duration>) -> Result<IssuedToken, DsError> {
        self.issue_at(discussion_id, ttl, Utc::now())
    }

    /// Deterministic issuance against an explicit clock.
    pub fn issue_at(
        &self,
        discussion_id: DiscussionId,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, DsError> {
        let ttl = self.policy.resolve(ttl)?;
        let ttl_secs = i64::try_from(ttl.as_secs()).map_err(|_| DsError::Internal)?;

        let mut jti = [0u8; 16];
        self.rng.fill(&mut jti).map_err(|_| {
            tracing::error!(target: "ds.auth.token_codec", "Failed to generate token id");
            DsError::Internal
        })?;

        let iat = now.timestamp();
        let exp = iat + ttl_secs;
        let claims = WireClaims {
            discussion_id: Some(discussion_id),
            purpose: INVITATION_PURPOSE.to_string(),
            iat,
            exp,
            jti: hex::encode(jti),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(
            |e| {
                tracing::error!(target: "ds.auth.token_codec", error = %e, "Failed to sign token");
                DsError::Internal
            },
        )?;

        Ok(IssuedToken {
            token,
            expires_at: timestamp(exp)?,
        })
    }

    /// Verify a token against the current time.
    ///
    /// # Errors
    ///
    /// `TokenInvalid(fault)` or `TokenExpired`.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, DsError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify a token against an explicit clock.
    ///
    /// Checks run in order: size, signature and structure, purpose,
    /// discussion claim, expiry.
    #[instrument(skip_all)]
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, DsError> {
        let result = self.check(token, now);
        metrics::record_token_verification(match &result {
            Ok(_) => "valid",
            Err(DsError::TokenExpired) => "expired",
            Err(DsError::TokenInvalid(fault)) => fault.as_str(),
            Err(_) => "error",
        });
        result
    }

    fn check(&self, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, DsError> {
        check_size(token).map_err(|_| DsError::TokenInvalid(TokenFault::TooLarge))?;

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked below so it can be reported after the claim checks
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();

        let claims = decode::<WireClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(target: "ds.auth.token_codec", error = %e, "Token rejected");
                match e.kind() {
                    ErrorKind::InvalidSignature => DsError::TokenInvalid(TokenFault::BadSignature),
                    _ => DsError::TokenInvalid(TokenFault::Malformed),
                }
            })?
            .claims;

        if claims.purpose != INVITATION_PURPOSE {
            return Err(DsError::TokenInvalid(TokenFault::PurposeMismatch));
        }

        let discussion_id = claims
            .discussion_id
            .ok_or(DsError::TokenInvalid(TokenFault::MissingDiscussion))?;

        if now.timestamp() >= claims.exp {
            return Err(DsError::TokenExpired);
        }

        Ok(TokenClaims {
            discussion_id,
            issued_at: timestamp(claims.iat)?,
            expires_at: timestamp(claims.exp)?,
        })
    }

    /// Read the claims without verifying anything. Display use only.
    ///
    /// # Errors
    ///
    /// `TokenInvalid` if the input is not structurally a token.
    pub fn peek(&self, token: &str) -> Result<TokenPeek, DsError> {
        let claims: PeekClaims = decode_unverified_payload(token).map_err(|e| match e {
            JwtValidationError::TokenTooLarge => DsError::TokenInvalid(TokenFault::TooLarge),
            _ => DsError::TokenInvalid(TokenFault::Malformed),
        })?;

        Ok(TokenPeek {
            discussion_id: claims.discussion_id,
            expires_at: timestamp(claims.exp)
                .map_err(|_| DsError::TokenInvalid(TokenFault::Malformed))?,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, DsError> {
    Utc.timestamp_opt(secs, 0).single().ok_or(DsError::Internal)
}
