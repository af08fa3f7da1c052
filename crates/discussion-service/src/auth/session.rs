//! Platform session tokens.
//!
//! Members authenticate with a bearer JWT (HS256 over
//! `SESSION_SIGNING_SECRET`). Accounts created during invitation acceptance
//! receive one straight away.

use crate::errors::DsError;
use crate::models::Account;
use chrono::Utc;
use common::jwt::{check_size, validate_iat};
use common::secret::{ExposeSecret, SecretString};
use common::types::AccountId;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::instrument;

/// Lifetime of sessions issued by this service.
pub const SESSION_TTL: Duration = Duration::from_secs(12 * 3600);

/// Session claims. `sub` and `email` are redacted in Debug output.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Account id.
    pub sub: String,
    pub name: String,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

impl fmt::Debug for SessionClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClaims")
            .field("sub", &"[REDACTED]")
            .field("name", &self.name)
            .field("email", &"[REDACTED]")
            .field("iat", &self.iat)
            .field("exp", &self.exp)
            .finish()
    }
}

impl SessionClaims {
    /// # Errors
    ///
    /// `AuthenticationRequired` if `sub` is not an account id.
    pub fn account_id(&self) -> Result<AccountId, DsError> {
        self.sub.parse().map_err(|_| DsError::AuthenticationRequired)
    }
}

/// Issues and validates platform sessions.
pub struct SessionCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    clock_skew: Duration,
}

impl SessionCodec {
    pub fn new(secret: &SecretString, clock_skew_seconds: i64) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(bytes),
            decoding_key: DecodingKey::from_secret(bytes),
            clock_skew: Duration::from_secs(clock_skew_seconds.unsigned_abs()),
        }
    }

    /// Validate a bearer session token.
    ///
    /// # Errors
    ///
    /// `AuthenticationRequired` for any failure; details are logged at debug.
    #[instrument(skip_all)]
    pub fn validate(&self, token: &str) -> Result<SessionClaims, DsError> {
        check_size(token).map_err(|_| DsError::AuthenticationRequired)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                tracing::debug!(target: "ds.auth.session", error = %e, "Session token rejected");
                DsError::AuthenticationRequired
            })?
            .claims;

        validate_iat(claims.iat, self.clock_skew).map_err(|e| {
            tracing::debug!(target: "ds.auth.session", error = ?e, "Session iat rejected");
            DsError::AuthenticationRequired
        })?;

        Ok(claims)
    }

    /// Issue a session for `account`.
    ///
    /// # Errors
    ///
    /// `Internal` on signing failure.
    pub fn issue(&self, account: &Account) -> Result<String, DsError> {
        let iat = Utc::now().timestamp();
        let ttl = i64::try_from(SESSION_TTL.as_secs()).map_err(|_| DsError::Internal)?;
        let claims = SessionClaims {
            sub: account.id.to_string(),
            name: account.display_name.clone(),
            email: account.email.clone(),
            iat,
            exp: iat + ttl,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(target: "ds.auth.session", error = %e, "Failed to sign session");
            DsError::Internal
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn codec() -> SessionCodec {
        SessionCodec::new(&SecretString::from("s".repeat(48)), 300)
    }

    fn account() -> Account {
        Account {
            id: AccountId::new(),
            email: "ms.frizzle@example.com".to_string(),
            display_name: "Ms. Frizzle".to_string(),
            password_hash: None,
            created_at: Utc::now(),
        }
    }

    fn sign(claims: &SessionClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_issue_then_validate() {
        let codec = codec();
        let account = account();
        let token = codec.issue(&account).unwrap();

        let claims = codec.validate(&token).unwrap();
        assert_eq!(claims.account_id().unwrap(), account.id);
        assert_eq!(claims.name, "Ms. Frizzle");
    }

    #[test]
    fn test_expired_session_rejected() {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: AccountId::new().to_string(),
            name: "A".to_string(),
            email: "a@example.com".to_string(),
            iat: now - 7200,
            exp: now - 3600,
        };
        let token = sign(&claims, &"s".repeat(48));
        assert!(matches!(
            codec().validate(&token),
            Err(DsError::AuthenticationRequired)
        ));
    }

    #[test]
    fn test_future_iat_rejected() {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: AccountId::new().to_string(),
            name: "A".to_string(),
            email: "a@example.com".to_string(),
            iat: now + 3600,
            exp: now + 7200,
        };
        let token = sign(&claims, &"s".repeat(48));
        assert!(codec().validate(&token).is_err());
    }

    #[test]
    fn test_invitation_secret_cannot_mint_sessions() {
        let now = Utc::now().timestamp();
        let claims = SessionClaims {
            sub: AccountId::new().to_string(),
            name: "A".to_string(),
            email: "a@example.com".to_string(),
            iat: now,
            exp: now + 60,
        };
        let token = sign(&claims, &"i".repeat(32));
        assert!(codec().validate(&token).is_err());
    }

    #[test]
    fn test_debug_redacts_identity() {
        let claims = codec().validate(&codec().issue(&account()).unwrap()).unwrap();
        let debug = format!("{claims:?}");
        assert!(!debug.contains(&claims.sub));
        assert!(!debug.contains("ms.frizzle@example.com"));
    }
}
