//! Joining and leaving discussions.
//!
//! Every way in (session rejoin, invitation accept, token join) ends in
//! [`ParticipationService::admit`]: the capacity guard reserves the seat,
//! the roster change is broadcast, and the caller gets the first page of
//! history.

use crate::auth::{CallerIdentity, SessionClaims};
use crate::errors::DsError;
use crate::models::api::{
    normalize_display_name, AcceptInvitationRequest, DiscussionSummary, JoinRequest, JoinResponse,
    LeaveResponse, ParticipantView,
};
use crate::models::{ParentFilter, Redemption, SeatRequest};
use crate::repositories::Store;
use crate::services::broadcaster::{EventKind, Presence, RealtimeBroadcaster};
use crate::services::capacity::CapacityGuard;
use crate::services::invitations::InvitationRegistry;
use crate::services::messages::MessageService;
use chrono::Utc;
use common::types::DiscussionId;
use std::sync::Arc;
use tracing::instrument;

/// History returned with a successful join.
pub const FIRST_PAGE_SIZE: u32 = 50;

pub struct ParticipationService {
    store: Arc<dyn Store>,
    registry: Arc<InvitationRegistry>,
    guard: CapacityGuard,
    messages: Arc<MessageService>,
    broadcaster: Arc<RealtimeBroadcaster>,
}

impl ParticipationService {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<InvitationRegistry>,
        messages: Arc<MessageService>,
        broadcaster: Arc<RealtimeBroadcaster>,
    ) -> Self {
        Self {
            guard: CapacityGuard::new(Arc::clone(&store)),
            store,
            registry,
            messages,
            broadcaster,
        }
    }

    /// Join `discussion_id`.
    ///
    /// An account that already holds an ACTIVE membership walks straight
    /// back in. Everyone else needs an invitation token for this
    /// discussion.
    ///
    /// # Errors
    ///
    /// `AuthenticationRequired` without session membership or token, plus
    /// every invitation and capacity failure.
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn join(
        &self,
        session: Option<&SessionClaims>,
        discussion_id: DiscussionId,
        request: &JoinRequest,
    ) -> Result<JoinResponse, DsError> {
        if let Some(claims) = session {
            let account_id = claims.account_id()?;
            if let Some(membership) = self.store.find_membership(discussion_id, account_id).await? {
                if membership.is_active() {
                    let display_name = match request.display_name.as_deref() {
                        Some(name) => normalize_display_name(name)?,
                        None => membership.display_name,
                    };
                    let seat = SeatRequest::Member {
                        account_id,
                        display_name,
                        role: membership.role,
                    };
                    return self.admit(discussion_id, &seat, None, None).await;
                }
            }
        }

        let token = request
            .token
            .as_deref()
            .ok_or(DsError::AuthenticationRequired)?;
        let acceptance = self
            .registry
            .accept(
                token,
                Some(discussion_id),
                session,
                &AcceptInvitationRequest {
                    display_name: request.display_name.clone(),
                    session_id: request.session_id.clone(),
                    new_account: None,
                },
            )
            .await?;

        self.admit(
            acceptance.discussion_id,
            &acceptance.seat,
            Some(acceptance.redemption),
            acceptance.session_token,
        )
        .await
    }

    /// Accept an invitation and take the seat it grants.
    #[instrument(skip_all)]
    pub async fn accept(
        &self,
        token: &str,
        session: Option<&SessionClaims>,
        request: &AcceptInvitationRequest,
    ) -> Result<JoinResponse, DsError> {
        let acceptance = self.registry.accept(token, None, session, request).await?;
        self.admit(
            acceptance.discussion_id,
            &acceptance.seat,
            Some(acceptance.redemption),
            acceptance.session_token,
        )
        .await
    }

    async fn admit(
        &self,
        discussion_id: DiscussionId,
        seat: &SeatRequest,
        redemption: Option<Redemption>,
        session_token: Option<String>,
    ) -> Result<JoinResponse, DsError> {
        let admission = self
            .guard
            .check_and_reserve(discussion_id, seat, redemption)
            .await?;

        if let SeatRequest::Registration { account } = seat {
            tracing::info!(
                target: "ds.services.participation",
                account_id = %account.id,
                "Account created on invitation accept"
            );
        }

        if admission.newly_admitted || admission.renamed_from.is_some() {
            self.broadcaster.publish(
                discussion_id,
                EventKind::ParticipantJoined(Presence::from(&admission.seat.roster_entry())),
            );
        }

        tracing::info!(
            target: "ds.services.participation",
            discussion_id = %discussion_id,
            newly_joined = admission.newly_admitted,
            renamed = admission.renamed_from.is_some(),
            "Participant admitted"
        );

        let discussion = self
            .store
            .get_discussion(discussion_id)
            .await?
            .ok_or(DsError::DiscussionNotFound)?;
        let count = self.store.active_seat_count(discussion_id).await?;
        let messages = self
            .messages
            .page(discussion_id, Some(FIRST_PAGE_SIZE), None, ParentFilter::Any)
            .await?;

        Ok(JoinResponse {
            participant: ParticipantView::from(&admission.seat),
            discussion: DiscussionSummary::new(&discussion, count),
            messages,
            newly_joined: admission.newly_admitted,
            session_token,
        })
    }

    /// Soft-close the caller's seat and announce it.
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn leave(
        &self,
        caller: &CallerIdentity,
        discussion_id: DiscussionId,
    ) -> Result<LeaveResponse, DsError> {
        let left = match caller {
            CallerIdentity::Anonymous { participant_id, .. } => {
                self.store.leave_participant(*participant_id, Utc::now()).await?
            }
            CallerIdentity::Account { account_id, .. } => {
                self.store.leave_membership(discussion_id, *account_id).await?
            }
        };

        if left {
            self.broadcaster
                .publish(discussion_id, EventKind::ParticipantLeft(Presence::from(caller)));
        }
        Ok(LeaveResponse { left })
    }
}
