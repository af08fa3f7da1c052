//! Repository layer for the discussion service.
//!
//! Storage is reached through async traits so services never see a concrete
//! backend. [`PgStore`] implements them on PostgreSQL with runtime-checked
//! queries; [`MemoryStore`] implements the same contracts in-process and
//! backs the test suite.
//!
//! # Atomicity
//!
//! Two operations must be atomic in every implementation:
//! - [`ParticipantRepository::reserve_seat`] (capacity check + insert +
//!   invitation bookkeeping)
//! - [`InvitationRepository::rotate_link_invitation`] (active token overwrite
//!   + new invitation row)

mod accounts;
mod discussions;
mod invitations;
pub mod memory;
mod messages;
mod participants;

pub use memory::MemoryStore;

use crate::errors::DsError;
use crate::models::{
    Account, Admission, Discussion, DiscussionParticipant, Invitation, InvitationFilter, Message,
    NewMessage, ParentFilter, Participant, ReactionCount, Redemption, RosterEntry, SeatRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{AccountId, DiscussionId, InvitationId, MessageId, ParticipantId};
use sqlx::PgPool;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Attempts for read paths before a transient failure surfaces.
const READ_RETRY_ATTEMPTS: u32 = 3;

/// First backoff delay; doubles per attempt.
const READ_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

#[async_trait]
pub trait DiscussionRepository: Send + Sync {
    /// Cheap liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), DsError>;

    /// Register a discussion handed over by the lesson layer, seating its
    /// owner as an ACTIVE member.
    async fn insert_discussion(
        &self,
        discussion: &Discussion,
        owner_display_name: &str,
    ) -> Result<(), DsError>;

    async fn get_discussion(&self, id: DiscussionId) -> Result<Option<Discussion>, DsError>;

    /// Mark a discussion closed. Returns `false` if it was already closed.
    async fn close_discussion(&self, id: DiscussionId, at: DateTime<Utc>) -> Result<bool, DsError>;

    /// Active members plus present anonymous participants.
    async fn active_seat_count(&self, id: DiscussionId) -> Result<i64, DsError>;
}

#[async_trait]
pub trait InvitationRepository: Send + Sync {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), DsError>;

    /// Store a new link invitation and make its token the discussion's only
    /// active link token, in one atomic step.
    async fn rotate_link_invitation(&self, invitation: &Invitation) -> Result<(), DsError>;

    async fn find_invitation(&self, id: InvitationId) -> Result<Option<Invitation>, DsError>;

    async fn find_invitation_by_token(&self, token: &str) -> Result<Option<Invitation>, DsError>;

    /// Most recent PENDING email invitation for `email` in a discussion.
    async fn find_pending_email_invitation(
        &self,
        discussion_id: DiscussionId,
        email: &str,
    ) -> Result<Option<Invitation>, DsError>;

    /// PENDING → DECLINED. Returns `false` if the row was not PENDING.
    async fn decline_invitation(&self, id: InvitationId, at: DateTime<Utc>)
        -> Result<bool, DsError>;

    /// PENDING → CANCELLED, clearing the discussion's active link token if it
    /// is this invitation's. Returns `false` if the row was not PENDING.
    async fn cancel_invitation(&self, id: InvitationId, at: DateTime<Utc>) -> Result<bool, DsError>;

    /// Replace token and expiry of a PENDING invitation.
    async fn refresh_invitation(
        &self,
        id: InvitationId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DsError>;

    /// Newest first, with the total count ignoring `limit`/`offset`.
    async fn list_invitations(
        &self,
        filter: &InvitationFilter,
    ) -> Result<(Vec<Invitation>, i64), DsError>;

    /// Mark PENDING invitations past expiry as EXPIRED. Returns rows changed.
    async fn expire_invitations(&self, now: DateTime<Utc>) -> Result<u64, DsError>;
}

#[async_trait]
pub trait ParticipantRepository: Send + Sync {
    /// Atomically admit a seat against the discussion's ceiling.
    ///
    /// Reuses an open row for the same anonymous session or account (never
    /// counted twice), reactivates a LEFT membership, and applies the
    /// invitation `redemption` in the same transaction.
    ///
    /// # Errors
    ///
    /// `DiscussionNotFound`, `DiscussionInactive`, `DiscussionFull`,
    /// `InvitationExhausted`. On error nothing is written.
    async fn reserve_seat(
        &self,
        discussion_id: DiscussionId,
        request: &SeatRequest,
        redemption: Option<Redemption>,
    ) -> Result<Admission, DsError>;

    async fn find_participant(&self, id: ParticipantId) -> Result<Option<Participant>, DsError>;

    async fn find_membership(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
    ) -> Result<Option<DiscussionParticipant>, DsError>;

    /// Soft-close an anonymous participant. Returns `false` if already left.
    async fn leave_participant(&self, id: ParticipantId, at: DateTime<Utc>)
        -> Result<bool, DsError>;

    /// ACTIVE → LEFT. Returns `false` if the membership was not ACTIVE.
    async fn leave_membership(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
    ) -> Result<bool, DsError>;

    /// Present participants, oldest first.
    async fn roster(&self, discussion_id: DiscussionId) -> Result<Vec<RosterEntry>, DsError>;

    /// Bump `message_count` and `last_seen_at` for a member.
    async fn record_member_activity(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<(), DsError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Append a message; the store assigns `seq` and `created_at`.
    async fn insert_message(&self, message: &NewMessage) -> Result<Message, DsError>;

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, DsError>;

    /// Up to `limit` messages with `seq < before_seq`, newest first.
    async fn page_messages(
        &self,
        discussion_id: DiscussionId,
        filter: ParentFilter,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>, DsError>;

    /// Up to `limit` messages with `seq > after_seq`, oldest first.
    ///
    /// `seq` is allocated at insert, not at commit, so a lower `seq` can
    /// become visible after a higher one. Tailing readers re-read a window
    /// behind their cursor.
    async fn messages_after(
        &self,
        discussion_id: DiscussionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Message>, DsError>;

    /// Highest `seq` in the discussion, 0 when empty.
    async fn latest_seq(&self, discussion_id: DiscussionId) -> Result<i64, DsError>;

    async fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, DsError>;

    async fn mark_message_deleted(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, DsError>;

    /// Add the reaction if absent, remove it if present; returns new counts.
    async fn toggle_reaction(
        &self,
        message_id: MessageId,
        reactor_key: &str,
        symbol: &str,
    ) -> Result<Vec<ReactionCount>, DsError>;

    async fn reaction_counts(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<ReactionCount>>, DsError>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn find_account(&self, id: AccountId) -> Result<Option<Account>, DsError>;

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, DsError>;

    /// # Errors
    ///
    /// `Conflict` if the email is already registered.
    async fn create_account(
        &self,
        email: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<Account, DsError>;
}

/// Everything the services need from storage.
pub trait Store:
    DiscussionRepository
    + InvitationRepository
    + ParticipantRepository
    + MessageRepository
    + AccountRepository
{
}

impl<T> Store for T where
    T: DiscussionRepository
        + InvitationRepository
        + ParticipantRepository
        + MessageRepository
        + AccountRepository
{
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Retry a read on transient failures with exponential backoff.
pub(crate) async fn retry_read<T, F, Fut>(operation: &'static str, mut op: F) -> Result<T, DsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DsError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < READ_RETRY_ATTEMPTS => {
                let delay = READ_RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    target: "ds.repositories",
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient read failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Map a stored enum text, reporting corrupt rows as database errors.
pub(crate) fn parse_column<T>(value: &str) -> Result<T, DsError>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(DsError::Database)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_read_recovers_from_transient_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_read("test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DsError::ServiceUnavailable("pool timed out".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_read_gives_up_after_bounded_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), DsError> = retry_read("test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DsError::ServiceUnavailable("down".to_string()))
        })
        .await;

        assert!(matches!(result, Err(DsError::ServiceUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), READ_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_read_does_not_retry_validation_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), DsError> = retry_read("test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DsError::DiscussionFull)
        })
        .await;

        assert!(matches!(result, Err(DsError::DiscussionFull)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
