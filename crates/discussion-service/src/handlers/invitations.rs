//! Invitation handlers.
//!
//! - `POST /api/v1/discussions/{id}/invitations` - email invitations (manager)
//! - `POST /api/v1/discussions/{id}/invitation-link` - rotate the link (manager)
//! - `GET /api/v1/invitations` - list sent invitations
//! - `POST /api/v1/invitations/{id}/cancel` / `resend`
//! - `GET /api/v1/invite/{token}` and `/validate` - public preview
//! - `POST /api/v1/invite/{token}/accept` / `decline`
//!
//! Tokens are never logged.

use super::extract::{parse_json, parse_json_or_default};
use crate::errors::DsError;
use crate::middleware::SessionContext;
use crate::models::api::{
    AcceptInvitationRequest, CreateLinkRequest, DeclineResponse, InvitationLookup,
    InvitationPage, InvitationValidity, InvitationView, JoinResponse, LinkInvitationResponse,
    ListInvitationsQuery, SendInvitationsRequest, SendInvitationsResponse,
};
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use common::types::{DiscussionId, InvitationId};
use std::sync::Arc;
use tracing::instrument;

/// Handler for POST /api/v1/discussions/{id}/invitations
///
/// Every recipient gets an outcome; the call itself only fails on
/// authorization, TTL, or discussion state.
#[instrument(skip_all, name = "ds.invitations.send", fields(discussion_id = %discussion_id))]
pub async fn send_invitations(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(discussion_id): Path<DiscussionId>,
    body: Bytes,
) -> Result<Json<SendInvitationsResponse>, DsError> {
    let request: SendInvitationsRequest = parse_json(&body)?;
    let response = state
        .invitations
        .create_email_invitations(session.claims(), discussion_id, &request)
        .await?;
    Ok(Json(response))
}

/// Handler for POST /api/v1/discussions/{id}/invitation-link
///
/// Replaces any previous link; the old token stops validating immediately.
#[instrument(skip_all, name = "ds.invitations.link", fields(discussion_id = %discussion_id))]
pub async fn create_link(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(discussion_id): Path<DiscussionId>,
    body: Bytes,
) -> Result<(StatusCode, Json<LinkInvitationResponse>), DsError> {
    let request: CreateLinkRequest = parse_json_or_default(&body)?;
    let response = state
        .invitations
        .create_link_invitation(session.claims(), discussion_id, &request)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[instrument(skip_all, name = "ds.invitations.list")]
pub async fn list_invitations(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Query(query): Query<ListInvitationsQuery>,
) -> Result<Json<InvitationPage>, DsError> {
    Ok(Json(state.invitations.list(session.claims(), &query).await?))
}

#[instrument(skip_all, name = "ds.invitations.cancel", fields(invitation_id = %invitation_id))]
pub async fn cancel_invitation(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(invitation_id): Path<InvitationId>,
) -> Result<Json<InvitationView>, DsError> {
    Ok(Json(
        state
            .invitations
            .cancel(session.claims(), invitation_id)
            .await?,
    ))
}

#[instrument(skip_all, name = "ds.invitations.resend", fields(invitation_id = %invitation_id))]
pub async fn resend_invitation(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(invitation_id): Path<InvitationId>,
) -> Result<Json<InvitationView>, DsError> {
    Ok(Json(
        state
            .invitations
            .resend(session.claims(), invitation_id)
            .await?,
    ))
}

/// Handler for GET /api/v1/invite/{token}
///
/// Invalid invitations are a 200 with `valid: false` and a stable reason.
#[instrument(skip_all, name = "ds.invitations.lookup")]
pub async fn get_invitation(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(token): Path<String>,
) -> Result<Json<InvitationLookup>, DsError> {
    Ok(Json(state.invitations.lookup(&token, session.claims()).await?))
}

#[instrument(skip_all, name = "ds.invitations.validate")]
pub async fn validate_invitation(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(token): Path<String>,
) -> Result<Json<InvitationValidity>, DsError> {
    Ok(Json(
        state.invitations.validate(&token, session.claims()).await?,
    ))
}

/// Handler for POST /api/v1/invite/{token}/accept
///
/// Admits the caller and returns the same payload as a join.
#[instrument(skip_all, name = "ds.invitations.accept")]
pub async fn accept_invitation(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(token): Path<String>,
    body: Bytes,
) -> Result<Json<JoinResponse>, DsError> {
    let request: AcceptInvitationRequest = parse_json_or_default(&body)?;
    let response = state
        .participation
        .accept(&token, session.claims(), &request)
        .await?;
    Ok(Json(response))
}

#[instrument(skip_all, name = "ds.invitations.decline")]
pub async fn decline_invitation(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<DeclineResponse>, DsError> {
    Ok(Json(state.invitations.decline(&token).await?))
}
