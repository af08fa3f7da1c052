//! Discussion service error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl. Each
//! variant carries a stable machine-readable `code` so clients can branch on
//! it; the human `message` is advisory. Infrastructure failures are logged
//! server-side and returned with a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Fine-grained reason a token failed verification.
///
/// Surfaced as `error.reason` alongside the coarse `TOKEN_INVALID` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFault {
    Malformed,
    TooLarge,
    BadSignature,
    PurposeMismatch,
    MissingDiscussion,
}

impl TokenFault {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenFault::Malformed => "malformed",
            TokenFault::TooLarge => "too_large",
            TokenFault::BadSignature => "bad_signature",
            TokenFault::PurposeMismatch => "purpose_mismatch",
            TokenFault::MissingDiscussion => "missing_discussion",
        }
    }
}

/// Discussion service error type.
///
/// Maps to HTTP status codes:
/// - Validation (`BadRequest`, content, parent): 400 / 422
/// - `AuthenticationRequired`, token failures: 401
/// - `WrongRecipient`, `SessionMismatch`, `Forbidden`: 403
/// - Not-found family: 404
/// - State conflicts (full, inactive, revoked, exhausted): 409 / 410
/// - `RateLimited`: 429
/// - `Database`, `Internal`: 500; `ServiceUnavailable`: 503
#[derive(Debug, Error)]
pub enum DsError {
    #[error("Token invalid: {}", .0.as_str())]
    TokenInvalid(TokenFault),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invitation not found")]
    InvitationNotFound,

    #[error("Invitation revoked or cancelled")]
    InvitationRevokedOrCancelled,

    #[error("Invitation has no uses left")]
    InvitationExhausted,

    #[error("Discussion not found")]
    DiscussionNotFound,

    #[error("Discussion is not accepting participants")]
    DiscussionInactive,

    #[error("Discussion is full")]
    DiscussionFull,

    #[error("Invitation was issued to a different recipient")]
    WrongRecipient,

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Participant session does not match this discussion")]
    SessionMismatch,

    #[error("Message not found")]
    MessageNotFound,

    #[error("Parent message is not part of this discussion")]
    InvalidParentMessage,

    #[error("Message content is empty")]
    ContentEmpty,

    #[error("Message content exceeds {max} characters")]
    ContentTooLong { max: usize },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    Internal,
}

impl DsError {
    /// Returns the HTTP status code for this error (for metrics recording).
    pub fn status_code(&self) -> u16 {
        match self {
            DsError::BadRequest(_) => 400,
            DsError::TokenInvalid(_) | DsError::TokenExpired | DsError::AuthenticationRequired => {
                401
            }
            DsError::WrongRecipient | DsError::SessionMismatch | DsError::Forbidden(_) => 403,
            DsError::InvitationNotFound | DsError::DiscussionNotFound | DsError::MessageNotFound => {
                404
            }
            DsError::DiscussionInactive
            | DsError::DiscussionFull
            | DsError::InvitationExhausted
            | DsError::Conflict(_) => 409,
            DsError::InvitationRevokedOrCancelled => 410,
            DsError::InvalidParentMessage
            | DsError::ContentEmpty
            | DsError::ContentTooLong { .. } => 422,
            DsError::RateLimited => 429,
            DsError::Database(_) | DsError::Internal => 500,
            DsError::ServiceUnavailable(_) => 503,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            DsError::TokenInvalid(_) => "TOKEN_INVALID",
            DsError::TokenExpired => "TOKEN_EXPIRED",
            DsError::InvitationNotFound => "INVITATION_NOT_FOUND",
            DsError::InvitationRevokedOrCancelled => "INVITATION_REVOKED_OR_CANCELLED",
            DsError::InvitationExhausted => "INVITATION_EXHAUSTED",
            DsError::DiscussionNotFound => "DISCUSSION_NOT_FOUND",
            DsError::DiscussionInactive => "DISCUSSION_INACTIVE",
            DsError::DiscussionFull => "DISCUSSION_FULL",
            DsError::WrongRecipient => "WRONG_RECIPIENT",
            DsError::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            DsError::SessionMismatch => "SESSION_MISMATCH",
            DsError::MessageNotFound => "MESSAGE_NOT_FOUND",
            DsError::InvalidParentMessage => "INVALID_PARENT_MESSAGE",
            DsError::ContentEmpty => "CONTENT_EMPTY",
            DsError::ContentTooLong { .. } => "CONTENT_TOO_LONG",
            DsError::RateLimited => "RATE_LIMITED",
            DsError::Forbidden(_) => "FORBIDDEN",
            DsError::BadRequest(_) => "BAD_REQUEST",
            DsError::Conflict(_) => "CONFLICT",
            DsError::Database(_) => "DATABASE_ERROR",
            DsError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            DsError::Internal => "INTERNAL_ERROR",
        }
    }

    /// Fine-grained reason, present for token failures only.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            DsError::TokenInvalid(fault) => Some(fault.as_str()),
            DsError::TokenExpired => Some("expired"),
            _ => None,
        }
    }

    /// Whether a caller may retry the same request unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, DsError::ServiceUnavailable(_))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    message: String,
}

impl IntoResponse for DsError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = match &self {
            DsError::Database(err) => {
                // Log actual error server-side, return generic message to client
                tracing::error!(target: "ds.database", error = %err, "Database operation failed");
                "An internal database error occurred".to_string()
            }
            DsError::ServiceUnavailable(reason) => {
                tracing::warn!(target: "ds.availability", reason = %reason, "Service unavailable");
                "Service temporarily unavailable".to_string()
            }
            DsError::Internal => "An internal error occurred".to_string(),
            DsError::RateLimited => "Too many messages. Please slow down.".to_string(),
            DsError::Forbidden(reason) | DsError::BadRequest(reason) | DsError::Conflict(reason) => {
                reason.clone()
            }
            other => other.to_string(),
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                reason: self.reason(),
                message,
            },
        };

        let mut response = (status, Json(error_response)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            let error = if matches!(self, DsError::AuthenticationRequired) {
                "invalid_request"
            } else {
                "invalid_token"
            };
            if let Ok(header_value) = format!("Bearer realm=\"agora\", error=\"{error}\"").parse() {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}

/// Convert sqlx errors to `DsError`.
///
/// Pool exhaustion and I/O failures are reported as unavailability so read
/// paths may retry them.
impl From<sqlx::Error> for DsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DsError::ServiceUnavailable(err.to_string())
            }
            other => DsError::Database(other.to_string()),
        }
    }
}
