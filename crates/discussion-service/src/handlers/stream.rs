//! Server-sent event stream of a discussion.

use super::extract::credentials;
use crate::errors::DsError;
use crate::middleware::SessionContext;
use crate::models::api::CredentialQuery;
use crate::routes::AppState;
use crate::services::broadcaster::{EventKind, StreamEvent};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    Extension,
};
use common::types::DiscussionId;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

const X_ACCEL_BUFFERING: &str = "x-accel-buffering";

/// Handler for GET /api/v1/discussions/{id}/stream
///
/// The first event is always `snapshot` and carries a `retry:` hint. The
/// stream ends when the client disconnects or the server shuts down.
#[instrument(skip_all, name = "ds.stream.open", fields(discussion_id = %discussion_id))]
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<SessionContext>,
    Path(discussion_id): Path<DiscussionId>,
    headers: HeaderMap,
    Query(query): Query<CredentialQuery>,
) -> Result<impl IntoResponse, DsError> {
    let creds = credentials(&headers, query)?;
    let caller = state
        .authenticator
        .resolve(session.claims(), discussion_id, &creds)
        .await?;

    let retry = state.broadcaster.keepalive_interval();
    let events = state
        .broadcaster
        .open_stream(discussion_id, &caller)
        .await?
        .map(move |event| Ok::<_, Infallible>(to_sse(&event, retry)));

    Ok((
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                HeaderName::from_static(X_ACCEL_BUFFERING),
                HeaderValue::from_static("no"),
            ),
        ],
        Sse::new(events),
    ))
}

fn to_sse(event: &StreamEvent, retry: Duration) -> Event {
    let sse = Event::default()
        .id(event.id.to_string())
        .event(event.event.name())
        .data(event.event.data().to_string());

    match event.event.kind {
        EventKind::Snapshot { .. } => sse.retry(retry),
        _ => sse,
    }
}
