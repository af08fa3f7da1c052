//! HTTP routes for the discussion service.
//!
//! Defines the Axum router and application state.

use crate::auth::{ParticipantAuthenticator, SessionCodec, TokenCodec};
use crate::config::Config;
use crate::handlers::{self, invitations, messages, participation, stream};
use crate::middleware::{http_metrics_middleware, optional_session};
use crate::repositories::Store;
use crate::services::{
    BroadcasterOptions, InvitationNotifier, InvitationRegistry, MessageService,
    ParticipationService, RateLimiter, RealtimeBroadcaster,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout for everything except the event stream.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
///
/// Built once in `main` (or a test harness); every collaborator is
/// constructed explicitly here rather than reached through globals.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    pub store: Arc<dyn Store>,

    pub sessions: Arc<SessionCodec>,

    pub authenticator: Arc<ParticipantAuthenticator>,

    pub invitations: Arc<InvitationRegistry>,

    pub participation: Arc<ParticipationService>,

    pub messages: Arc<MessageService>,

    pub broadcaster: Arc<RealtimeBroadcaster>,
}

impl AppState {
    /// Wire the services over `store`. Open streams end when `shutdown`
    /// is cancelled.
    pub fn new(
        store: Arc<dyn Store>,
        config: Config,
        notifier: Arc<dyn InvitationNotifier>,
        shutdown: CancellationToken,
    ) -> Self {
        let codec = Arc::new(TokenCodec::from_config(&config));
        let sessions = Arc::new(SessionCodec::new(
            &config.session_signing_secret,
            config.jwt_clock_skew_seconds,
        ));

        let broadcaster = Arc::new(RealtimeBroadcaster::new(
            Arc::clone(&store),
            BroadcasterOptions::from_config(&config),
            shutdown,
        ));
        let messages = Arc::new(MessageService::new(
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            RateLimiter::new(config.message_rate_limit_per_minute),
        ));
        let invitations = Arc::new(InvitationRegistry::new(
            Arc::clone(&store),
            Arc::clone(&codec),
            Arc::clone(&sessions),
            notifier,
            config.public_base_url.clone(),
        ));
        let participation = Arc::new(ParticipationService::new(
            Arc::clone(&store),
            Arc::clone(&invitations),
            Arc::clone(&messages),
            Arc::clone(&broadcaster),
        ));
        let authenticator = Arc::new(ParticipantAuthenticator::new(Arc::clone(&store), codec));

        Self {
            config,
            store,
            sessions,
            authenticator,
            invitations,
            participation,
            messages,
            broadcaster,
        }
    }
}

/// Build the application routes.
///
/// - `/health`, `/metrics` - operational, unauthenticated
/// - `/api/v1/...` - optional bearer session; anonymous callers present an
///   invitation token and participant id
///
/// The event stream is exempt from the request timeout.
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .with_state(state.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    let request_routes = Router::new()
        .route("/invitations", get(invitations::list_invitations))
        .route("/invitations/:id/cancel", post(invitations::cancel_invitation))
        .route("/invitations/:id/resend", post(invitations::resend_invitation))
        .route("/invite/:token", get(invitations::get_invitation))
        .route("/invite/:token/validate", get(invitations::validate_invitation))
        .route("/invite/:token/accept", post(invitations::accept_invitation))
        .route("/invite/:token/decline", post(invitations::decline_invitation))
        .route(
            "/discussions/:id/invitations",
            post(invitations::send_invitations),
        )
        .route(
            "/discussions/:id/invitation-link",
            post(invitations::create_link),
        )
        .route("/discussions/:id/join", post(participation::join))
        .route("/discussions/:id/leave", post(participation::leave))
        .route(
            "/discussions/:id/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route("/discussions/:id/typing", post(messages::typing))
        .route(
            "/messages/:id",
            axum::routing::patch(messages::edit_message).delete(messages::delete_message),
        )
        .route("/messages/:id/reactions", post(messages::react))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let stream_routes = Router::new().route("/discussions/:id/stream", get(stream::stream));

    let api_routes = request_routes
        .merge(stream_routes)
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            optional_session,
        ))
        .with_state(state);

    // Layer order (bottom-to-top execution):
    // 1. TraceLayer - Log request details
    // 2. HTTP metrics - Record every response, including 404/405/415 (outermost)
    Router::new()
        .merge(public_routes)
        .merge(metrics_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(http_metrics_middleware))
}
