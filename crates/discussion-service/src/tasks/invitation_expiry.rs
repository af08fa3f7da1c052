//! Invitation expiry sweep.
//!
//! Periodically moves PENDING invitations whose `expires_at` has passed to
//! EXPIRED. Validation already treats such rows as expired, so the sweep
//! only keeps stored status in line with reality.
//!
//! # Graceful Shutdown
//!
//! The task exits when its cancellation token is cancelled. An in-flight
//! sweep completes first.

use crate::observability::metrics;
use crate::repositories::Store;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Start the invitation expiry sweep.
///
/// Runs one sweep immediately, then every `interval`, until
/// `cancel_token` is cancelled.
#[instrument(skip_all, name = "ds.task.invitation_expiry")]
pub async fn start_invitation_sweeper(
    store: Arc<dyn Store>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "ds.task.invitation_expiry",
        interval_seconds = interval.as_secs(),
        "Starting invitation expiry task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(store.as_ref()).await;
            }
            _ = cancel_token.cancelled() => {
                info!(
                    target: "ds.task.invitation_expiry",
                    "Invitation expiry task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "ds.task.invitation_expiry", "Invitation expiry task stopped");
}

/// Run a single sweep. Failures are logged and retried on the next tick.
pub(crate) async fn sweep_once(store: &dyn Store) -> u64 {
    match store.expire_invitations(Utc::now()).await {
        Ok(0) => 0,
        Ok(count) => {
            metrics::record_invitations_expired(count);
            info!(
                target: "ds.task.invitation_expiry",
                expired = count,
                "Expired stale invitations"
            );
            count
        }
        Err(e) => {
            warn!(
                target: "ds.task.invitation_expiry",
                error = %e,
                "Invitation expiry sweep failed"
            );
            0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{Discussion, Invitation, InvitationKind, InvitationStatus};
    use crate::repositories::{
        AccountRepository, DiscussionRepository, InvitationRepository, MemoryStore,
    };
    use chrono::{DateTime, Duration as ChronoDuration};
    use common::types::InvitationId;

    fn pending_email(discussion: &Discussion, email: &str, expires_at: DateTime<Utc>) -> Invitation {
        Invitation {
            id: InvitationId::new(),
            kind: InvitationKind::Email,
            discussion_id: discussion.id,
            recipient_email: email.to_string(),
            recipient_account_id: None,
            sender_id: discussion.owner_id,
            status: InvitationStatus::Pending,
            token: format!("token-{email}"),
            expires_at,
            max_uses: None,
            use_count: 0,
            responded_at: None,
            created_at: Utc::now(),
        }
    }

    async fn seeded() -> (Arc<MemoryStore>, Discussion) {
        let store = Arc::new(MemoryStore::new());
        let owner = store
            .create_account("owner@example.com", "Owner", "hash")
            .await
            .unwrap();
        let discussion = Discussion::new("Tides", owner.id, None);
        store.insert_discussion(&discussion, "Owner").await.unwrap();
        (store, discussion)
    }

    #[tokio::test]
    async fn test_sweep_expires_only_stale_pending_rows() {
        let (store, discussion) = seeded().await;
        let now = Utc::now();

        let stale = pending_email(&discussion, "stale@example.com", now - ChronoDuration::minutes(1));
        let fresh = pending_email(&discussion, "fresh@example.com", now + ChronoDuration::hours(1));
        store.insert_invitation(&stale).await.unwrap();
        store.insert_invitation(&fresh).await.unwrap();

        assert_eq!(sweep_once(store.as_ref()).await, 1);

        let stale = store.find_invitation(stale.id).await.unwrap().unwrap();
        let fresh = store.find_invitation(fresh.id).await.unwrap().unwrap();
        assert_eq!(stale.status, InvitationStatus::Expired);
        assert_eq!(fresh.status, InvitationStatus::Pending);

        // Second pass has nothing left to do
        assert_eq!(sweep_once(store.as_ref()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_exits_on_cancel() {
        let (store, _) = seeded().await;
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(start_invitation_sweeper(
            store,
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should exit promptly")
            .expect("sweeper should not panic");
    }
}
