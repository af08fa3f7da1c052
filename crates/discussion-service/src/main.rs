//! Discussion Service
//!
//! Serves invitations, admission, the message log and live event streams
//! for AI-facilitated discussions.

use discussion_service::config::Config;
use discussion_service::observability::metrics::init_metrics_recorder;
use discussion_service::repositories::PgStore;
use discussion_service::routes::{self, AppState};
use discussion_service::services::LogNotifier;
use discussion_service::tasks::start_invitation_sweeper;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // LOG_FORMAT=json for structured output, human-readable otherwise
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "discussion_service=debug,ds=debug,tower_http=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    info!("Starting Discussion Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        public_base_url = %config.public_base_url,
        stream_delivery = config.stream_delivery.as_str(),
        jwt_clock_skew_seconds = config.jwt_clock_skew_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    info!("Connecting to database...");
    let db_url_with_timeout = add_query_timeout(&config.database_url, 5);
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_url_with_timeout)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            e
        })?;

    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            e
        })?;
    info!("Database connection established, migrations applied");

    let bind_address = config.bind_address.clone();
    let drain = Duration::from_secs(config.drain_seconds);
    let sweep_interval = Duration::from_secs(config.invitation_sweep_interval_seconds);

    // Cancelling this ends every open stream and background task
    let shutdown_token = CancellationToken::new();

    let state = Arc::new(AppState::new(
        Arc::new(PgStore::new(db_pool)),
        config,
        Arc::new(LogNotifier),
        shutdown_token.child_token(),
    ));

    let sweeper = tokio::spawn(start_invitation_sweeper(
        Arc::clone(&state.store),
        sweep_interval,
        shutdown_token.child_token(),
    ));

    let app = routes::build_routes(Arc::clone(&state), metrics_handle);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Discussion Service listening on {}", addr);

    let server_token = shutdown_token.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Streams never finish on their own; end them so the server can drain
        server_token.cancel();
        drain_period(drain).await;
    })
    .await?;

    shutdown_token.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Invitation sweeper ended abnormally");
    }

    info!("Discussion Service shutdown complete");

    Ok(())
}

/// Returns when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn drain_period(drain: Duration) {
    if drain.is_zero() {
        info!("Skipping drain period (DS_DRAIN_SECONDS=0)");
        return;
    }
    warn!("Draining connections for {} seconds...", drain.as_secs());
    tokio::time::sleep(drain).await;
    info!("Drain period complete");
}

/// Adds statement_timeout to the database URL so queries cannot hang.
fn add_query_timeout(url: &str, timeout_secs: u32) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}options=-c%20statement_timeout%3D{}s",
        url, separator, timeout_secs
    )
}
