//! Join and leave.

use super::extract::{credentials, parse_json_or_default};
use crate::errors::DsError;
use crate::middleware::SessionContext;
use crate::models::api::{CredentialQuery, JoinRequest, JoinResponse, LeaveResponse};
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Extension, Json,
};
use common::types::DiscussionId;
use std::sync::Arc;
use tracing::instrument;

/// Handler for POST /api/v1/discussions/{id}/join
///
/// Members with an active membership need no body. Everyone else sends the
/// invitation token, plus a display name and session id when anonymous.
#[instrument(skip_all, name = "ds.participation.join", fields(discussion_id = %discussion_id))]
pub async fn join(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(discussion_id): Path<DiscussionId>,
    body: Bytes,
) -> Result<Json<JoinResponse>, DsError> {
    let request: JoinRequest = parse_json_or_default(&body)?;
    let response = state
        .participation
        .join(session.claims(), discussion_id, &request)
        .await?;
    Ok(Json(response))
}

#[instrument(skip_all, name = "ds.participation.leave", fields(discussion_id = %discussion_id))]
pub async fn leave(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(discussion_id): Path<DiscussionId>,
    headers: HeaderMap,
    Query(query): Query<CredentialQuery>,
) -> Result<Json<LeaveResponse>, DsError> {
    let creds = credentials(&headers, query)?;
    let caller = state
        .authenticator
        .resolve(session.claims(), discussion_id, &creds)
        .await?;
    Ok(Json(state.participation.leave(&caller, discussion_id).await?))
}
