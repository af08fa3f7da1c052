//! Optional platform session on API routes.
//!
//! Members send `Authorization: Bearer <session>`; anonymous participants
//! send nothing. A header that is present but unusable is rejected rather
//! than silently downgraded to anonymous.

use crate::auth::SessionClaims;
use crate::errors::DsError;
use crate::routes::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::instrument;

/// Session of the current request, if any. Always present in extensions
/// on routes behind [`optional_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionContext(pub Option<SessionClaims>);

impl SessionContext {
    pub fn claims(&self) -> Option<&SessionClaims> {
        self.0.as_ref()
    }
}

/// Resolve the bearer session, if one was sent, into a [`SessionContext`].
///
/// # Response
///
/// - 401 with `WWW-Authenticate` if the header is malformed or the session
///   fails validation
/// - Otherwise continues with the context in request extensions
#[instrument(skip_all, name = "ds.middleware.session")]
pub async fn optional_session(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, DsError> {
    let context = match extract_bearer_token(&req)? {
        Some(token) => SessionContext(Some(state.sessions.validate(token)?)),
        None => SessionContext(None),
    };

    req.extensions_mut().insert(context);

    Ok(next.run(req).await)
}

fn extract_bearer_token(req: &Request) -> Result<Option<&str>, DsError> {
    let Some(header) = req.headers().get("authorization") else {
        return Ok(None);
    };

    header
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(Some)
        .ok_or_else(|| {
            tracing::debug!(
                target: "ds.middleware.session",
                "Invalid Authorization header format"
            );
            DsError::AuthenticationRequired
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(header: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/api/v1/invitations");
        if let Some(value) = header {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).expect("request builder should succeed")
    }

    #[test]
    fn test_missing_header_is_anonymous() {
        let req = request_with(None);
        assert_eq!(extract_bearer_token(&req).unwrap(), None);
    }

    #[test]
    fn test_bearer_token_is_extracted() {
        let req = request_with(Some("Bearer abc.def.ghi"));
        assert_eq!(extract_bearer_token(&req).unwrap(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_non_bearer_scheme_is_rejected() {
        let req = request_with(Some("Basic dXNlcjpwYXNz"));
        assert!(matches!(
            extract_bearer_token(&req),
            Err(DsError::AuthenticationRequired)
        ));
    }
}
