//! Admission against a discussion's participant ceiling.
//!
//! The count, the ceiling check and the seat write happen inside one
//! [`ParticipantRepository::reserve_seat`](crate::repositories::ParticipantRepository::reserve_seat)
//! call, so concurrent joins at the last slot admit exactly one.

use crate::errors::DsError;
use crate::models::{Admission, SeatRequest, Redemption};
use crate::observability::metrics;
use crate::repositories::Store;
use common::types::DiscussionId;
use std::sync::Arc;
use tracing::instrument;

pub struct CapacityGuard {
    store: Arc<dyn Store>,
}

impl CapacityGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Admit `request` or reject it.
    ///
    /// # Errors
    ///
    /// - `DiscussionFull` - no seat left
    /// - `DiscussionInactive` / `DiscussionNotFound`
    /// - `InvitationExhausted` - the redeemed link ran out of uses meanwhile
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn check_and_reserve(
        &self,
        discussion_id: DiscussionId,
        request: &SeatRequest,
        redemption: Option<Redemption>,
    ) -> Result<Admission, DsError> {
        let kind = match request {
            SeatRequest::Anonymous { .. } => "anonymous",
            SeatRequest::Member { .. } | SeatRequest::Registration { .. } => "account",
        };

        match self.store.reserve_seat(discussion_id, request, redemption).await {
            Ok(admission) => {
                let outcome = if admission.newly_admitted {
                    "admitted"
                } else {
                    "rejoined"
                };
                metrics::record_join(kind, outcome);
                tracing::debug!(
                    target: "ds.services.capacity",
                    outcome,
                    "Seat reserved"
                );
                Ok(admission)
            }
            Err(e) => {
                metrics::record_join(kind, e.code());
                tracing::debug!(
                    target: "ds.services.capacity",
                    error = %e,
                    "Seat refused"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::Discussion;
    use crate::repositories::{AccountRepository, DiscussionRepository, MemoryStore};

    #[tokio::test]
    async fn test_last_slot_goes_to_exactly_one_of_many() {
        let store = Arc::new(MemoryStore::new());
        let owner = store
            .create_account("owner@example.com", "Owner", "hash")
            .await
            .unwrap();
        // Owner holds one of the two seats
        let discussion = Discussion::new("Tides", owner.id, Some(2));
        store.insert_discussion(&discussion, "Owner").await.unwrap();
        let guard = Arc::new(CapacityGuard::new(store.clone()));

        let attempts = (0..16).map(|i| {
            let guard = Arc::clone(&guard);
            async move {
                guard
                    .check_and_reserve(
                        discussion.id,
                        &SeatRequest::Anonymous {
                            display_name: format!("Guest {i}"),
                            session_id: format!("sess-{i}"),
                        },
                        None,
                    )
                    .await
            }
        });
        let results = futures::future::join_all(attempts).await;

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(DsError::DiscussionFull)))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(full, 15);
        assert_eq!(store.active_seat_count(discussion.id).await.unwrap(), 2);
    }
}
