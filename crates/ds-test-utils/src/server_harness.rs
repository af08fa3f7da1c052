//! Test server harness for end-to-end tests.
//!
//! Spawns the real router on a random local port, backed by an in-memory
//! store and a notifier that records deliveries instead of sending them.

use discussion_service::config::Config;
use discussion_service::models::{Account, Discussion};
use discussion_service::repositories::{AccountRepository, DiscussionRepository, MemoryStore};
use discussion_service::routes::{self, AppState};
use discussion_service::services::notifier::mock::RecordingNotifier;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A discussion seeded for a test, with its owner signed in.
pub struct SeededDiscussion {
    pub discussion: Discussion,
    pub owner: Account,
    /// Bearer session of the owner.
    pub owner_session: String,
}

/// Test harness for the discussion service.
///
/// The server is aborted and open streams are cancelled when this value is
/// dropped.
pub struct TestDsServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    shutdown: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestDsServer {
    /// Spawn with default test configuration (push delivery).
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(HashMap::new()).await
    }

    /// Spawn with configuration overrides, e.g. `STREAM_DELIVERY=poll` or a
    /// short `STREAM_KEEPALIVE_SECONDS`.
    pub async fn spawn_with(overrides: HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            (
                "DATABASE_URL".to_string(),
                "postgresql://unused-in-memory".to_string(),
            ),
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            (
                "PUBLIC_BASE_URL".to_string(),
                "http://agora.test".to_string(),
            ),
            (
                "INVITATION_SIGNING_SECRET".to_string(),
                "test-invitation-secret-0123456789abcdef".to_string(),
            ),
            (
                "SESSION_SIGNING_SECRET".to_string(),
                "test-session-secret-0123456789abcdef!!".to_string(),
            ),
        ]);
        vars.extend(overrides);
        let config = Config::from_vars(&vars)?;

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let shutdown = CancellationToken::new();

        let state = Arc::new(AppState::new(
            store.clone(),
            config,
            notifier.clone(),
            shutdown.clone(),
        ));
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
        let app = routes::build_routes(Arc::clone(&state), metrics_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                eprintln!("Server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            state,
            store,
            notifier,
            shutdown,
            _handle: handle,
        })
    }

    /// Base URL, e.g. "http://127.0.0.1:12345".
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// URL of an `/api/v1` path.
    pub fn api(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<RecordingNotifier> {
        &self.notifier
    }

    /// End every open stream, as a server shutdown would.
    pub fn shutdown_streams(&self) {
        self.shutdown.cancel();
    }

    /// Create an account (unusable password) and return it with a session.
    pub async fn sign_up(&self, email: &str, display_name: &str) -> (Account, String) {
        let account = self
            .store
            .create_account(email, display_name, "!unusable")
            .await
            .expect("account creation should succeed");
        let session = self
            .state
            .sessions
            .issue(&account)
            .expect("session issue should succeed");
        (account, session)
    }

    /// Seed an open discussion owned by a fresh account.
    pub async fn seed_discussion(&self, max_participants: Option<i32>) -> SeededDiscussion {
        let owner_email = format!("owner-{}@example.com", common::types::AccountId::new());
        let (owner, owner_session) = self.sign_up(&owner_email, "Owner").await;
        let discussion = Discussion::new("What makes a city walkable?", owner.id, max_participants);
        self.store
            .insert_discussion(&discussion, &owner.display_name)
            .await
            .expect("discussion seed should succeed");
        SeededDiscussion {
            discussion,
            owner,
            owner_session,
        }
    }
}

impl Drop for TestDsServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self._handle.abort();
    }
}
