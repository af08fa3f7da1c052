//! Message handlers.
//!
//! Every operation resolves the caller against the discussion first.
//! Message-scoped routes look up the owning discussion from the message.

use super::extract::{credentials, parse_json};
use crate::auth::CallerIdentity;
use crate::errors::DsError;
use crate::middleware::SessionContext;
use crate::models::api::{
    CredentialQuery, EditMessageRequest, ListMessagesQuery, MessagePage, MessageView,
    ReactRequest, ReactionsResponse, SendMessageRequest, TypingRequest,
};
use crate::models::ParentFilter;
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use common::types::{DiscussionId, MessageId};
use std::sync::Arc;
use tracing::instrument;

async fn resolve_caller(
    state: &AppState,
    session: &SessionContext,
    discussion_id: DiscussionId,
    headers: &HeaderMap,
    query: CredentialQuery,
) -> Result<CallerIdentity, DsError> {
    let creds = credentials(headers, query)?;
    state
        .authenticator
        .resolve(session.claims(), discussion_id, &creds)
        .await
}

fn parent_filter(query: &ListMessagesQuery) -> ParentFilter {
    match (query.parent_id, query.top_level) {
        (Some(parent_id), _) => ParentFilter::RepliesTo(parent_id),
        (None, Some(true)) => ParentFilter::TopLevel,
        (None, _) => ParentFilter::Any,
    }
}

/// Handler for GET /api/v1/discussions/{id}/messages
///
/// Newest first. Pass `nextCursor` back as `cursor` for older messages.
#[instrument(skip_all, name = "ds.messages.list", fields(discussion_id = %discussion_id))]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(discussion_id): Path<DiscussionId>,
    headers: HeaderMap,
    Query(creds): Query<CredentialQuery>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessagePage>, DsError> {
    resolve_caller(&state, &session, discussion_id, &headers, creds).await?;
    let page = state
        .messages
        .page(
            discussion_id,
            query.limit,
            query.cursor.as_deref(),
            parent_filter(&query),
        )
        .await?;
    Ok(Json(page))
}

#[instrument(skip_all, name = "ds.messages.send", fields(discussion_id = %discussion_id))]
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(discussion_id): Path<DiscussionId>,
    headers: HeaderMap,
    Query(creds): Query<CredentialQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<MessageView>), DsError> {
    let request: SendMessageRequest = parse_json(&body)?;
    let caller = resolve_caller(&state, &session, discussion_id, &headers, creds).await?;
    let message = state
        .messages
        .send(&caller, discussion_id, &request.content, request.parent_id)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[instrument(skip_all, name = "ds.messages.edit", fields(message_id = %message_id))]
pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(message_id): Path<MessageId>,
    headers: HeaderMap,
    Query(creds): Query<CredentialQuery>,
    body: Bytes,
) -> Result<Json<MessageView>, DsError> {
    let request: EditMessageRequest = parse_json(&body)?;
    let discussion_id = state.messages.discussion_of(message_id).await?;
    let caller = resolve_caller(&state, &session, discussion_id, &headers, creds).await?;
    let message = state
        .messages
        .edit(&caller, discussion_id, message_id, &request.content)
        .await?;
    Ok(Json(message))
}

#[instrument(skip_all, name = "ds.messages.delete", fields(message_id = %message_id))]
pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(message_id): Path<MessageId>,
    headers: HeaderMap,
    Query(creds): Query<CredentialQuery>,
) -> Result<Json<MessageView>, DsError> {
    let discussion_id = state.messages.discussion_of(message_id).await?;
    let caller = resolve_caller(&state, &session, discussion_id, &headers, creds).await?;
    let message = state
        .messages
        .delete(&caller, discussion_id, message_id)
        .await?;
    Ok(Json(message))
}

/// Handler for POST /api/v1/messages/{id}/reactions
///
/// Toggles the caller's reaction and returns the new counts.
#[instrument(skip_all, name = "ds.messages.react", fields(message_id = %message_id))]
pub async fn react(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(message_id): Path<MessageId>,
    headers: HeaderMap,
    Query(creds): Query<CredentialQuery>,
    body: Bytes,
) -> Result<Json<ReactionsResponse>, DsError> {
    let request: ReactRequest = parse_json(&body)?;
    let discussion_id = state.messages.discussion_of(message_id).await?;
    let caller = resolve_caller(&state, &session, discussion_id, &headers, creds).await?;
    let reactions = state
        .messages
        .react(&caller, discussion_id, message_id, &request.symbol)
        .await?;
    Ok(Json(reactions))
}

#[instrument(skip_all, name = "ds.messages.typing", fields(discussion_id = %discussion_id))]
pub async fn typing(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(discussion_id): Path<DiscussionId>,
    headers: HeaderMap,
    Query(creds): Query<CredentialQuery>,
    body: Bytes,
) -> Result<StatusCode, DsError> {
    let request: TypingRequest = parse_json(&body)?;
    let caller = resolve_caller(&state, &session, discussion_id, &headers, creds).await?;
    state
        .messages
        .set_typing(&caller, discussion_id, request.is_typing);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_filter_prefers_explicit_parent() {
        let parent = MessageId::new();
        let query = ListMessagesQuery {
            parent_id: Some(parent),
            top_level: Some(true),
            ..Default::default()
        };
        assert_eq!(parent_filter(&query), ParentFilter::RepliesTo(parent));
    }

    #[test]
    fn test_parent_filter_top_level_and_default() {
        let top = ListMessagesQuery {
            top_level: Some(true),
            ..Default::default()
        };
        assert_eq!(parent_filter(&top), ParentFilter::TopLevel);
        assert_eq!(parent_filter(&ListMessagesQuery::default()), ParentFilter::Any);
    }
}
