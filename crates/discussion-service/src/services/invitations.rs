//! Invitation records and token redemption.
//!
//! Two flavours share one table:
//!
//! - **Email**: one row per recipient, each with its own token, individually
//!   revocable.
//! - **Link**: one shareable token per discussion. The token is also stored
//!   on the discussion; issuing a new link overwrites it, which revokes
//!   every earlier link even though their signatures still verify.
//!
//! Validation always cross-checks the stored row (and, for links, the
//! discussion's active token). A valid signature alone admits nobody.

use crate::auth::{SessionClaims, SessionCodec, TokenCodec};
use crate::errors::DsError;
use crate::models::api::{
    invite_url, normalize_display_name, validate_session_id, AcceptInvitationRequest,
    CreateLinkRequest, DeclineResponse, DiscussionSummary, InvitationLookup, InvitationPage,
    InvitationValidity, InvitationView, LinkInvitationResponse, ListInvitationsQuery,
    NewAccountRequest, RecipientOutcome, RecipientStatus, SendInvitationsRequest,
    SendInvitationsResponse, MIN_PASSWORD_CHARS,
};
use crate::models::{
    Account, Discussion, DiscussionParticipant, Invitation, InvitationFilter, InvitationKind,
    InvitationStatus, MemberRole, MembershipStatus, Redemption, SeatRequest,
};
use crate::observability::metrics;
use crate::repositories::Store;
use crate::services::notifier::{InvitationDelivery, InvitationNotifier};
use chrono::Utc;
use common::types::{AccountId, DiscussionId, InvitationId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Bcrypt work factor for accounts created on accept.
const BCRYPT_COST: u32 = 12;

const DEFAULT_LIST_PAGE_SIZE: u32 = 20;
const MAX_LIST_PAGE_SIZE: u32 = 100;

/// How much of the validation ladder to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    /// Everything, including seat availability and remaining link uses.
    Preview,
    /// Seat availability and link uses are left to the atomic reservation,
    /// so a rejoin never trips over a seat it already holds.
    Admission,
}

/// A token that passed validation, with the rows it resolved to.
struct Validated {
    invitation: Invitation,
    discussion: Discussion,
}

/// What accepting a token grants: a seat request plus the invitation
/// bookkeeping to apply with it.
#[derive(Debug, Clone)]
pub struct Acceptance {
    pub discussion_id: DiscussionId,
    pub seat: SeatRequest,
    pub redemption: Redemption,
    /// Set when the accept created an account.
    pub session_token: Option<String>,
}

pub struct InvitationRegistry {
    store: Arc<dyn Store>,
    codec: Arc<TokenCodec>,
    sessions: Arc<SessionCodec>,
    notifier: Arc<dyn InvitationNotifier>,
    public_base_url: String,
}

impl InvitationRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        codec: Arc<TokenCodec>,
        sessions: Arc<SessionCodec>,
        notifier: Arc<dyn InvitationNotifier>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            codec,
            sessions,
            notifier,
            public_base_url: public_base_url.into(),
        }
    }

    // ------------------------------------------------------------------------
    // Sender operations
    // ------------------------------------------------------------------------

    /// Invite each recipient by email.
    ///
    /// Recipients are trimmed, lower-cased and de-duplicated; each gets its
    /// own outcome. A notifier failure keeps the row and reports
    /// `delivery_failed`.
    ///
    /// # Errors
    ///
    /// Request-level failures only: bad recipient count or TTL, missing
    /// sender rights, closed discussion.
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn create_email_invitations(
        &self,
        session: Option<&SessionClaims>,
        discussion_id: DiscussionId,
        request: &SendInvitationsRequest,
    ) -> Result<SendInvitationsResponse, DsError> {
        let requested_ttl = request.validate()?;
        let ttl = self.codec.policy().resolve(requested_ttl)?;
        let manager = self.require_manager(session, discussion_id).await?;
        let discussion = self.open_discussion(discussion_id).await?;

        let mut seen = HashSet::new();
        let mut results = Vec::with_capacity(request.recipients.len());
        for raw in &request.recipients {
            let email = raw.trim().to_lowercase();
            if !seen.insert(email.clone()) {
                continue;
            }
            let outcome = self
                .invite_one(&discussion, &manager, &email, ttl)
                .await?;
            results.push(outcome);
        }

        let sent = results
            .iter()
            .filter(|r| r.status == RecipientStatus::Sent)
            .count();
        tracing::info!(
            target: "ds.services.invitations",
            recipients = results.len(),
            sent,
            "Email invitations processed"
        );

        Ok(SendInvitationsResponse { results, sent })
    }

    async fn invite_one(
        &self,
        discussion: &Discussion,
        manager: &DiscussionParticipant,
        email: &str,
        ttl: Duration,
    ) -> Result<RecipientOutcome, DsError> {
        let outcome = |status, invitation_id| RecipientOutcome {
            email: email.to_string(),
            status,
            invitation_id,
        };

        if !is_valid_email(email) {
            return Ok(outcome(RecipientStatus::InvalidEmail, None));
        }

        let account = self.store.find_account_by_email(email).await?;
        if let Some(account) = &account {
            let membership = self.store.find_membership(discussion.id, account.id).await?;
            if membership.is_some_and(|m| m.is_active()) {
                return Ok(outcome(RecipientStatus::AlreadyMember, None));
            }
        }

        let now = Utc::now();
        if let Some(existing) = self
            .store
            .find_pending_email_invitation(discussion.id, email)
            .await?
        {
            if !existing.is_expired_at(now) {
                return Ok(outcome(RecipientStatus::AlreadyInvited, Some(existing.id)));
            }
        }

        let issued = self.codec.issue(discussion.id, Some(ttl))?;
        let invitation = Invitation {
            id: InvitationId::new(),
            kind: InvitationKind::Email,
            discussion_id: discussion.id,
            recipient_email: email.to_string(),
            recipient_account_id: account.map(|a| a.id),
            sender_id: manager.account_id,
            status: InvitationStatus::Pending,
            token: issued.token,
            expires_at: issued.expires_at,
            max_uses: None,
            use_count: 0,
            responded_at: None,
            created_at: now,
        };
        self.store.insert_invitation(&invitation).await?;
        metrics::record_invitation_created("email");

        match self.notify(discussion, manager, &invitation).await {
            Ok(()) => Ok(outcome(RecipientStatus::Sent, Some(invitation.id))),
            Err(e) => {
                tracing::warn!(
                    target: "ds.services.invitations",
                    invitation_id = %invitation.id,
                    error = %e,
                    "Invitation stored but delivery failed"
                );
                Ok(outcome(RecipientStatus::DeliveryFailed, Some(invitation.id)))
            }
        }
    }

    /// Issue a new shareable link, revoking the previous one.
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn create_link_invitation(
        &self,
        session: Option<&SessionClaims>,
        discussion_id: DiscussionId,
        request: &CreateLinkRequest,
    ) -> Result<LinkInvitationResponse, DsError> {
        let requested_ttl = request.validate()?;
        let manager = self.require_manager(session, discussion_id).await?;
        self.open_discussion(discussion_id).await?;

        let issued = self.codec.issue(discussion_id, requested_ttl)?;
        let invitation = Invitation {
            id: InvitationId::new(),
            kind: InvitationKind::Link,
            discussion_id,
            recipient_email: String::new(),
            recipient_account_id: None,
            sender_id: manager.account_id,
            status: InvitationStatus::Pending,
            token: issued.token,
            expires_at: issued.expires_at,
            max_uses: request.max_uses,
            use_count: 0,
            responded_at: None,
            created_at: Utc::now(),
        };
        self.store.rotate_link_invitation(&invitation).await?;
        metrics::record_invitation_created("link");

        tracing::info!(
            target: "ds.services.invitations",
            invitation_id = %invitation.id,
            expires_at = %invitation.expires_at,
            "Link invitation rotated"
        );

        Ok(LinkInvitationResponse {
            url: invite_url(&self.public_base_url, &invitation.token),
            token: invitation.token.clone(),
            invitation: InvitationView::new(&invitation, &self.public_base_url),
        })
    }

    /// PENDING → CANCELLED. Cancelling the active link also clears it from
    /// the discussion.
    #[instrument(skip_all, fields(invitation_id = %invitation_id))]
    pub async fn cancel(
        &self,
        session: Option<&SessionClaims>,
        invitation_id: InvitationId,
    ) -> Result<InvitationView, DsError> {
        let invitation = self.find(invitation_id).await?;
        self.require_manager(session, invitation.discussion_id).await?;

        if !self.store.cancel_invitation(invitation_id, Utc::now()).await? {
            return Err(DsError::Conflict("Invitation is no longer pending".to_string()));
        }

        let cancelled = self.find(invitation_id).await?;
        Ok(InvitationView::new(&cancelled, &self.public_base_url))
    }

    /// Fresh token and expiry for a PENDING email invitation, then notify
    /// again. The status stays PENDING.
    #[instrument(skip_all, fields(invitation_id = %invitation_id))]
    pub async fn resend(
        &self,
        session: Option<&SessionClaims>,
        invitation_id: InvitationId,
    ) -> Result<InvitationView, DsError> {
        let invitation = self.find(invitation_id).await?;
        let manager = self.require_manager(session, invitation.discussion_id).await?;

        if invitation.kind != InvitationKind::Email {
            return Err(DsError::BadRequest(
                "Only email invitations can be resent".to_string(),
            ));
        }
        if invitation.status != InvitationStatus::Pending {
            return Err(DsError::Conflict("Invitation is no longer pending".to_string()));
        }
        let discussion = self.open_discussion(invitation.discussion_id).await?;

        let issued = self.codec.issue(invitation.discussion_id, None)?;
        if !self
            .store
            .refresh_invitation(invitation_id, &issued.token, issued.expires_at)
            .await?
        {
            return Err(DsError::Conflict("Invitation is no longer pending".to_string()));
        }

        let refreshed = self.find(invitation_id).await?;
        self.notify(&discussion, &manager, &refreshed).await?;
        Ok(InvitationView::new(&refreshed, &self.public_base_url))
    }

    /// Invitations the caller may see: a discussion's (managers only), or
    /// the caller's own sent invitations.
    #[instrument(skip_all)]
    pub async fn list(
        &self,
        session: Option<&SessionClaims>,
        query: &ListInvitationsQuery,
    ) -> Result<InvitationPage, DsError> {
        let claims = session.ok_or(DsError::AuthenticationRequired)?;
        let account_id = claims.account_id()?;

        let sender_id = match query.discussion_id {
            Some(discussion_id) => {
                self.require_manager(session, discussion_id).await?;
                None
            }
            None => Some(account_id),
        };

        let page = query.page.unwrap_or(1).max(1);
        let per_page = query
            .per_page
            .unwrap_or(DEFAULT_LIST_PAGE_SIZE)
            .clamp(1, MAX_LIST_PAGE_SIZE);

        let (invitations, total) = self
            .store
            .list_invitations(&InvitationFilter {
                sender_id,
                discussion_id: query.discussion_id,
                status: query.status,
                limit: i64::from(per_page),
                offset: i64::from(page - 1) * i64::from(per_page),
            })
            .await?;

        Ok(InvitationPage {
            invitations: invitations
                .iter()
                .map(|i| InvitationView::new(i, &self.public_base_url))
                .collect(),
            page,
            per_page,
            total,
        })
    }

    // ------------------------------------------------------------------------
    // Recipient operations
    // ------------------------------------------------------------------------

    /// Whether `token` would admit its holder right now.
    ///
    /// Validation failures come back as `valid: false` with a stable reason;
    /// only infrastructure failures are errors.
    #[instrument(skip_all)]
    pub async fn validate(
        &self,
        token: &str,
        session: Option<&SessionClaims>,
    ) -> Result<InvitationValidity, DsError> {
        let result = async {
            let validated = self.check(token, Check::Preview).await?;
            if let Some(claims) = session {
                let account = self.session_account(claims).await?;
                authorize_recipient(&validated.invitation, Some(&account))?;
            }
            let count = self.store.active_seat_count(validated.discussion.id).await?;
            Ok::<_, DsError>(DiscussionSummary::new(&validated.discussion, count))
        }
        .await;

        match result {
            Ok(summary) => Ok(InvitationValidity::valid(summary)),
            Err(e) if is_infrastructure(&e) => Err(e),
            Err(e) => Ok(InvitationValidity::invalid(&e)),
        }
    }

    /// Invitation view behind a token, with its validity.
    ///
    /// `expiresAt` comes from the token itself so an expired link can still
    /// say when it expired.
    #[instrument(skip_all)]
    pub async fn lookup(
        &self,
        token: &str,
        session: Option<&SessionClaims>,
    ) -> Result<InvitationLookup, DsError> {
        let validity = self.validate(token, session).await?;
        let peek = self.codec.peek(token).ok();
        let invitation = if peek.is_some() {
            self.store.find_invitation_by_token(token).await?
        } else {
            None
        };

        Ok(InvitationLookup {
            validity,
            kind: invitation.as_ref().map(|i| i.kind),
            status: invitation.as_ref().map(|i| i.status),
            recipient_email: invitation
                .as_ref()
                .filter(|i| !i.recipient_email.is_empty())
                .map(|i| i.recipient_email.clone()),
            expires_at: peek.map(|p| p.expires_at),
            remaining_uses: invitation.as_ref().and_then(Invitation::remaining_uses),
        })
    }

    /// Decline a PENDING email invitation.
    #[instrument(skip_all)]
    pub async fn decline(&self, token: &str) -> Result<DeclineResponse, DsError> {
        self.codec.verify(token)?;
        let invitation = self
            .store
            .find_invitation_by_token(token)
            .await?
            .ok_or(DsError::InvitationNotFound)?;

        if invitation.kind == InvitationKind::Link {
            return Err(DsError::BadRequest(
                "Link invitations cannot be declined".to_string(),
            ));
        }
        if !self
            .store
            .decline_invitation(invitation.id, Utc::now())
            .await?
        {
            return Err(DsError::Conflict("Invitation is no longer pending".to_string()));
        }

        tracing::info!(
            target: "ds.services.invitations",
            invitation_id = %invitation.id,
            "Invitation declined"
        );
        Ok(DeclineResponse {
            id: invitation.id,
            status: InvitationStatus::Declined,
        })
    }

    /// Resolve what accepting `token` grants.
    ///
    /// With a session the caller enters as that account. With `newAccount`
    /// an account is created first and a session token comes back.
    /// Otherwise the caller enters anonymously and must supply a display
    /// name and session id.
    ///
    /// `expected_discussion` pins the token to a discussion (join path).
    ///
    /// # Errors
    ///
    /// Every validation failure, plus `WrongRecipient` for a mismatched
    /// account and `AuthenticationRequired` for an anonymous caller holding
    /// an account-bound email invitation.
    #[instrument(skip_all)]
    pub async fn accept(
        &self,
        token: &str,
        expected_discussion: Option<DiscussionId>,
        session: Option<&SessionClaims>,
        request: &AcceptInvitationRequest,
    ) -> Result<Acceptance, DsError> {
        let Validated {
            invitation,
            discussion,
        } = self.check(token, Check::Admission).await?;

        if expected_discussion.is_some_and(|expected| expected != discussion.id) {
            return Err(DsError::SessionMismatch);
        }

        let redemption = Redemption {
            invitation_id: invitation.id,
            kind: invitation.kind,
        };

        if let Some(claims) = session {
            let account = self.session_account(claims).await?;
            authorize_recipient(&invitation, Some(&account))?;
            let seat = self
                .member_seat(discussion.id, &account, request.display_name.as_deref())
                .await?;
            return Ok(Acceptance {
                discussion_id: discussion.id,
                seat,
                redemption,
                session_token: None,
            });
        }

        if let Some(new_account) = &request.new_account {
            let email = new_account.email.trim().to_lowercase();
            if invitation.kind == InvitationKind::Email && invitation.recipient_email != email {
                return Err(DsError::WrongRecipient);
            }
            // Refuse early before paying for the password hash; the store
            // repeats both checks atomically with the account insert
            if invitation.is_exhausted() {
                return Err(DsError::InvitationExhausted);
            }
            let count = self.store.active_seat_count(discussion.id).await?;
            if !discussion.has_room_for_one_more(count) {
                return Err(DsError::DiscussionFull);
            }

            let account = self.prepare_account(new_account, &email).await?;
            let session_token = self.sessions.issue(&account)?;
            let seat = SeatRequest::Registration { account };
            return Ok(Acceptance {
                discussion_id: discussion.id,
                seat,
                redemption,
                session_token: Some(session_token),
            });
        }

        authorize_recipient(&invitation, None)?;
        let display_name = request
            .display_name
            .as_deref()
            .ok_or_else(|| DsError::BadRequest("displayName is required".to_string()))?;
        let session_id = request
            .session_id
            .as_deref()
            .ok_or_else(|| DsError::BadRequest("sessionId is required".to_string()))?;

        Ok(Acceptance {
            discussion_id: discussion.id,
            seat: SeatRequest::Anonymous {
                display_name: normalize_display_name(display_name)?,
                session_id: validate_session_id(session_id)?,
            },
            redemption,
            session_token: None,
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// The validation ladder, first failure wins:
    /// signature and claims, row, status, active link token, remaining uses,
    /// discussion state, seat availability.
    async fn check(&self, token: &str, mode: Check) -> Result<Validated, DsError> {
        let claims = self.codec.verify(token)?;

        let invitation = self
            .store
            .find_invitation_by_token(token)
            .await?
            .ok_or(DsError::InvitationNotFound)?;
        if invitation.discussion_id != claims.discussion_id {
            return Err(DsError::InvitationNotFound);
        }

        match invitation.status {
            InvitationStatus::Cancelled | InvitationStatus::Declined => {
                return Err(DsError::InvitationRevokedOrCancelled);
            }
            InvitationStatus::Expired => return Err(DsError::TokenExpired),
            // Accepted stays usable for the seat it created; the store refuses new ones
            InvitationStatus::Pending | InvitationStatus::Accepted => {}
        }
        if invitation.is_expired_at(Utc::now()) {
            return Err(DsError::TokenExpired);
        }

        let discussion = self
            .store
            .get_discussion(invitation.discussion_id)
            .await?
            .ok_or(DsError::DiscussionNotFound)?;

        if invitation.kind == InvitationKind::Link
            && discussion.current_invitation_token.as_deref() != Some(token)
        {
            return Err(DsError::InvitationRevokedOrCancelled);
        }
        if mode == Check::Preview && invitation.is_exhausted() {
            return Err(DsError::InvitationExhausted);
        }
        if !discussion.is_open() {
            return Err(DsError::DiscussionInactive);
        }
        if mode == Check::Preview {
            let count = self.store.active_seat_count(discussion.id).await?;
            if !discussion.has_room_for_one_more(count) {
                return Err(DsError::DiscussionFull);
            }
        }

        Ok(Validated {
            invitation,
            discussion,
        })
    }

    /// Seat for an account, keeping its existing role.
    async fn member_seat(
        &self,
        discussion_id: DiscussionId,
        account: &Account,
        requested_name: Option<&str>,
    ) -> Result<SeatRequest, DsError> {
        let membership = self.store.find_membership(discussion_id, account.id).await?;
        if membership
            .as_ref()
            .is_some_and(|m| m.status == MembershipStatus::Removed)
        {
            return Err(DsError::Forbidden(
                "Removed from this discussion".to_string(),
            ));
        }

        let display_name = match requested_name {
            Some(name) => normalize_display_name(name)?,
            None => membership
                .as_ref()
                .map_or_else(|| account.display_name.clone(), |m| m.display_name.clone()),
        };
        Ok(SeatRequest::Member {
            account_id: account.id,
            display_name,
            role: membership.map_or(MemberRole::Member, |m| m.role),
        })
    }

    /// Validate and hash a new account. It is persisted by the seat
    /// reservation, together with its membership.
    async fn prepare_account(
        &self,
        request: &NewAccountRequest,
        email: &str,
    ) -> Result<Account, DsError> {
        if !is_valid_email(email) {
            return Err(DsError::BadRequest("Invalid email format".to_string()));
        }
        if request.password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(DsError::BadRequest(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_CHARS
            )));
        }
        let display_name = normalize_display_name(&request.display_name)?;
        if self.store.find_account_by_email(email).await?.is_some() {
            return Err(DsError::Conflict(
                "An account with this email already exists".to_string(),
            ));
        }

        let password = request.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, BCRYPT_COST))
            .await
            .map_err(|e| {
                tracing::error!(target: "ds.services.invitations", error = %e, "Hashing task failed");
                DsError::Internal
            })?
            .map_err(|e| {
                tracing::error!(target: "ds.services.invitations", error = %e, "Password hashing failed");
                DsError::Internal
            })?;

        Ok(Account {
            id: AccountId::new(),
            email: email.to_string(),
            display_name,
            password_hash: Some(password_hash),
            created_at: Utc::now(),
        })
    }

    async fn session_account(&self, claims: &SessionClaims) -> Result<Account, DsError> {
        let account_id: AccountId = claims.account_id()?;
        self.store
            .find_account(account_id)
            .await?
            .ok_or(DsError::AuthenticationRequired)
    }

    /// ACTIVE owner or moderator of the discussion.
    async fn require_manager(
        &self,
        session: Option<&SessionClaims>,
        discussion_id: DiscussionId,
    ) -> Result<DiscussionParticipant, DsError> {
        let claims = session.ok_or(DsError::AuthenticationRequired)?;
        let account_id = claims.account_id()?;

        if self.store.get_discussion(discussion_id).await?.is_none() {
            return Err(DsError::DiscussionNotFound);
        }
        match self.store.find_membership(discussion_id, account_id).await? {
            Some(membership) if membership.is_active() && membership.role.can_moderate() => {
                Ok(membership)
            }
            _ => Err(DsError::Forbidden(
                "Only owners and moderators manage invitations".to_string(),
            )),
        }
    }

    async fn open_discussion(&self, discussion_id: DiscussionId) -> Result<Discussion, DsError> {
        let discussion = self
            .store
            .get_discussion(discussion_id)
            .await?
            .ok_or(DsError::DiscussionNotFound)?;
        if !discussion.is_open() {
            return Err(DsError::DiscussionInactive);
        }
        Ok(discussion)
    }

    async fn find(&self, invitation_id: InvitationId) -> Result<Invitation, DsError> {
        self.store
            .find_invitation(invitation_id)
            .await?
            .ok_or(DsError::InvitationNotFound)
    }

    async fn notify(
        &self,
        discussion: &Discussion,
        sender: &DiscussionParticipant,
        invitation: &Invitation,
    ) -> Result<(), DsError> {
        self.notifier
            .deliver(&InvitationDelivery {
                invitation_id: invitation.id,
                discussion_id: discussion.id,
                discussion_title: discussion.title.clone(),
                recipient_email: invitation.recipient_email.clone(),
                sender_name: sender.display_name.clone(),
                url: invite_url(&self.public_base_url, &invitation.token),
                expires_at: invitation.expires_at,
            })
            .await
    }
}

/// Email invitations admit only their recipient.
///
/// A row bound to an account admits that account alone; an unbound row
/// admits an account with the same address, or an anonymous caller.
fn authorize_recipient(invitation: &Invitation, account: Option<&Account>) -> Result<(), DsError> {
    if invitation.kind != InvitationKind::Email {
        return Ok(());
    }
    match (invitation.recipient_account_id, account) {
        (Some(bound), Some(account)) if bound == account.id => Ok(()),
        (Some(_), Some(_)) => Err(DsError::WrongRecipient),
        (Some(_), None) => Err(DsError::AuthenticationRequired),
        (None, Some(account)) if account.email.eq_ignore_ascii_case(&invitation.recipient_email) => {
            Ok(())
        }
        (None, Some(_)) => Err(DsError::WrongRecipient),
        (None, None) => Ok(()),
    }
}

fn is_infrastructure(error: &DsError) -> bool {
    matches!(
        error,
        DsError::Database(_) | DsError::ServiceUnavailable(_) | DsError::Internal
    )
}

/// Basic shape check: `local@domain.tld`, no whitespace.
fn is_valid_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::TtlPolicy;
    use crate::repositories::{
        AccountRepository, DiscussionRepository, InvitationRepository, MemoryStore,
    };
    use crate::services::notifier::mock::RecordingNotifier;
    use common::secret::SecretString;

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        codec: Arc<TokenCodec>,
        sessions: Arc<SessionCodec>,
        registry: InvitationRegistry,
        discussion: Discussion,
        owner: Account,
        owner_session: SessionClaims,
    }

    async fn fixture(max_participants: Option<i32>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let owner = store
            .create_account("frizzle@example.com", "Ms. Frizzle", "hash")
            .await
            .unwrap();
        let discussion = Discussion::new("Magic School Bus", owner.id, max_participants);
        store.insert_discussion(&discussion, "Ms. Frizzle").await.unwrap();

        let codec = Arc::new(TokenCodec::new(
            &SecretString::from("i".repeat(32)),
            TtlPolicy {
                min: HOUR,
                max: 7 * 24 * HOUR,
                default: 24 * HOUR,
            },
        ));
        let sessions = Arc::new(SessionCodec::new(&SecretString::from("s".repeat(48)), 300));
        let notifier = Arc::new(RecordingNotifier::new());
        let registry = InvitationRegistry::new(
            store.clone(),
            codec.clone(),
            sessions.clone(),
            notifier.clone(),
            "https://agora.test",
        );
        let owner_session = sessions.validate(&sessions.issue(&owner).unwrap()).unwrap();

        Fixture {
            store,
            notifier,
            codec,
            sessions,
            registry,
            discussion,
            owner,
            owner_session,
        }
    }

    impl Fixture {
        async fn link(&self) -> String {
            self.registry
                .create_link_invitation(
                    Some(&self.owner_session),
                    self.discussion.id,
                    &CreateLinkRequest::default(),
                )
                .await
                .unwrap()
                .token
        }

        async fn session_for(&self, email: &str, name: &str) -> (Account, SessionClaims) {
            let account = self.store.create_account(email, name, "hash").await.unwrap();
            let claims = self
                .sessions
                .validate(&self.sessions.issue(&account).unwrap())
                .unwrap();
            (account, claims)
        }
    }

    fn anonymous(name: &str, session: &str) -> AcceptInvitationRequest {
        AcceptInvitationRequest {
            display_name: Some(name.to_string()),
            session_id: Some(session.to_string()),
            new_account: None,
        }
    }

    #[tokio::test]
    async fn test_rotating_link_revokes_previous_token() {
        let f = fixture(None).await;
        let first = f.link().await;
        assert!(f.registry.validate(&first, None).await.unwrap().valid);

        let second = f.link().await;
        let stale = f.registry.validate(&first, None).await.unwrap();
        assert!(!stale.valid);
        assert_eq!(stale.reason, Some("INVITATION_REVOKED_OR_CANCELLED"));
        assert!(f.registry.validate(&second, None).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_validate_reports_stable_reasons() {
        let f = fixture(Some(1)).await;
        let token = f.link().await;

        // Owner holds the only seat
        let full = f.registry.validate(&token, None).await.unwrap();
        assert_eq!(full.reason, Some("DISCUSSION_FULL"));

        let unknown = f.codec.issue(f.discussion.id, None).unwrap().token;
        let missing = f.registry.validate(&unknown, None).await.unwrap();
        assert_eq!(missing.reason, Some("INVITATION_NOT_FOUND"));

        let garbage = f.registry.validate("not-a-token", None).await.unwrap();
        assert_eq!(garbage.reason, Some("TOKEN_INVALID"));

        f.store.close_discussion(f.discussion.id, Utc::now()).await.unwrap();
        let closed = f.registry.validate(&token, None).await.unwrap();
        assert_eq!(closed.reason, Some("DISCUSSION_INACTIVE"));
    }

    #[tokio::test]
    async fn test_expired_row_is_reported_before_the_sweep() {
        let f = fixture(None).await;
        let now = Utc::now();
        let issued = f
            .codec
            .issue_at(f.discussion.id, None, now - chrono::Duration::hours(25))
            .unwrap();
        let invitation = Invitation {
            id: InvitationId::new(),
            kind: InvitationKind::Email,
            discussion_id: f.discussion.id,
            recipient_email: "late@example.com".to_string(),
            recipient_account_id: None,
            sender_id: f.owner.id,
            status: InvitationStatus::Pending,
            token: issued.token.clone(),
            expires_at: issued.expires_at,
            max_uses: None,
            use_count: 0,
            responded_at: None,
            created_at: now,
        };
        f.store.insert_invitation(&invitation).await.unwrap();

        let validity = f.registry.validate(&issued.token, None).await.unwrap();
        assert_eq!(validity.reason, Some("TOKEN_EXPIRED"));

        // The lookup still knows when it expired
        let lookup = f.registry.lookup(&issued.token, None).await.unwrap();
        assert_eq!(lookup.expires_at, Some(issued.expires_at));
    }

    #[tokio::test]
    async fn test_email_invitation_outcomes() {
        let f = fixture(None).await;
        f.notifier.fail_for("broken@example.com");

        let response = f
            .registry
            .create_email_invitations(
                Some(&f.owner_session),
                f.discussion.id,
                &SendInvitationsRequest {
                    recipients: vec![
                        " Ada@Example.com ".to_string(),
                        "ada@example.com".to_string(),
                        "not-an-email".to_string(),
                        "frizzle@example.com".to_string(),
                        "broken@example.com".to_string(),
                    ],
                    ttl_days: Some(2),
                },
            )
            .await
            .unwrap();

        let statuses: Vec<(&str, RecipientStatus)> = response
            .results
            .iter()
            .map(|r| (r.email.as_str(), r.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("ada@example.com", RecipientStatus::Sent),
                ("not-an-email", RecipientStatus::InvalidEmail),
                ("frizzle@example.com", RecipientStatus::AlreadyMember),
                ("broken@example.com", RecipientStatus::DeliveryFailed),
            ]
        );
        assert_eq!(response.sent, 1);
        assert!(f.notifier.last_for("ada@example.com").is_some());

        let again = f
            .registry
            .create_email_invitations(
                Some(&f.owner_session),
                f.discussion.id,
                &SendInvitationsRequest {
                    recipients: vec!["ada@example.com".to_string()],
                    ttl_days: Some(2),
                },
            )
            .await
            .unwrap();
        assert_eq!(again.results.first().unwrap().status, RecipientStatus::AlreadyInvited);
    }

    #[tokio::test]
    async fn test_ttl_outside_policy_is_rejected_before_any_write() {
        let f = fixture(None).await;
        let result = f
            .registry
            .create_email_invitations(
                Some(&f.owner_session),
                f.discussion.id,
                &SendInvitationsRequest {
                    recipients: vec!["ada@example.com".to_string()],
                    ttl_days: Some(30),
                },
            )
            .await;
        assert!(matches!(result, Err(DsError::BadRequest(_))));
        assert!(f.notifier.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_only_managers_send_invitations() {
        let f = fixture(None).await;
        let (_, stranger) = f.session_for("arnold@example.com", "Arnold").await;

        let result = f
            .registry
            .create_link_invitation(Some(&stranger), f.discussion.id, &CreateLinkRequest::default())
            .await;
        assert!(matches!(result, Err(DsError::Forbidden(_))));

        let anonymous = f
            .registry
            .create_link_invitation(None, f.discussion.id, &CreateLinkRequest::default())
            .await;
        assert!(matches!(anonymous, Err(DsError::AuthenticationRequired)));
    }

    #[tokio::test]
    async fn test_bound_email_invitation_admits_only_its_account() {
        let f = fixture(None).await;
        let (_ada, ada_session) = f.session_for("ada@example.com", "Ada").await;
        let (_, grace_session) = f.session_for("grace@example.com", "Grace").await;

        f.registry
            .create_email_invitations(
                Some(&f.owner_session),
                f.discussion.id,
                &SendInvitationsRequest {
                    recipients: vec!["ada@example.com".to_string()],
                    ttl_days: None,
                },
            )
            .await
            .unwrap();
        let token = f.notifier.last_for("ada@example.com").unwrap().url;
        let token = token.rsplit('/').next().unwrap().to_string();

        let wrong = f
            .registry
            .accept(&token, None, Some(&grace_session), &AcceptInvitationRequest::default())
            .await;
        assert!(matches!(wrong, Err(DsError::WrongRecipient)));

        let validity = f.registry.validate(&token, Some(&grace_session)).await.unwrap();
        assert_eq!(validity.reason, Some("WRONG_RECIPIENT"));

        let anonymous_attempt = f
            .registry
            .accept(&token, None, None, &anonymous("Ada", "sess-ada"))
            .await;
        assert!(matches!(anonymous_attempt, Err(DsError::AuthenticationRequired)));

        let acceptance = f
            .registry
            .accept(&token, None, Some(&ada_session), &AcceptInvitationRequest::default())
            .await
            .unwrap();
        assert!(matches!(acceptance.seat, SeatRequest::Member { role: MemberRole::Member, .. }));
        assert_eq!(acceptance.redemption.kind, InvitationKind::Email);
    }

    #[tokio::test]
    async fn test_accept_with_new_account_issues_session() {
        let f = fixture(None).await;
        let token = f.link().await;

        let acceptance = f
            .registry
            .accept(
                &token,
                None,
                None,
                &AcceptInvitationRequest {
                    display_name: None,
                    session_id: None,
                    new_account: Some(NewAccountRequest {
                        email: "New@Example.com".to_string(),
                        display_name: "Newcomer".to_string(),
                        password: "long enough".to_string(),
                    }),
                },
            )
            .await
            .unwrap();

        let session = f
            .sessions
            .validate(acceptance.session_token.as_deref().unwrap())
            .unwrap();
        let account = match &acceptance.seat {
            SeatRequest::Registration { account } => Some(account),
            _ => None,
        }
        .expect("new account should come back as a registration seat");
        assert_eq!(session.account_id().unwrap(), account.id);
        assert_eq!(account.email, "new@example.com");
        assert!(bcrypt::verify("long enough", account.password_hash.as_deref().unwrap()).unwrap());
        // Written only when the seat is granted
        assert!(f
            .store
            .find_account_by_email("new@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_anonymous_accept_needs_name_and_session() {
        let f = fixture(None).await;
        let token = f.link().await;
        let result = f
            .registry
            .accept(&token, None, None, &AcceptInvitationRequest::default())
            .await;
        assert!(matches!(result, Err(DsError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_join_path_pins_token_to_its_discussion() {
        let f = fixture(None).await;
        let token = f.link().await;
        let result = f
            .registry
            .accept(&token, Some(DiscussionId::new()), None, &anonymous("Bob", "sess-1"))
            .await;
        assert!(matches!(result, Err(DsError::SessionMismatch)));
    }

    #[tokio::test]
    async fn test_cancel_clears_active_link_and_decline_is_email_only() {
        let f = fixture(None).await;
        let link = f
            .registry
            .create_link_invitation(Some(&f.owner_session), f.discussion.id, &CreateLinkRequest::default())
            .await
            .unwrap();

        assert!(matches!(
            f.registry.decline(&link.token).await,
            Err(DsError::BadRequest(_))
        ));

        let cancelled = f
            .registry
            .cancel(Some(&f.owner_session), link.invitation.id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, InvitationStatus::Cancelled);
        let discussion = f.store.get_discussion(f.discussion.id).await.unwrap().unwrap();
        assert!(discussion.current_invitation_token.is_none());

        let validity = f.registry.validate(&link.token, None).await.unwrap();
        assert_eq!(validity.reason, Some("INVITATION_REVOKED_OR_CANCELLED"));

        assert!(matches!(
            f.registry.cancel(Some(&f.owner_session), link.invitation.id).await,
            Err(DsError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_resend_replaces_token_and_keeps_pending() {
        let f = fixture(None).await;
        let response = f
            .registry
            .create_email_invitations(
                Some(&f.owner_session),
                f.discussion.id,
                &SendInvitationsRequest {
                    recipients: vec!["ada@example.com".to_string()],
                    ttl_days: None,
                },
            )
            .await
            .unwrap();
        let invitation_id = response.results.first().unwrap().invitation_id.unwrap();
        let before = f.store.find_invitation(invitation_id).await.unwrap().unwrap();

        let view = f
            .registry
            .resend(Some(&f.owner_session), invitation_id)
            .await
            .unwrap();
        assert_eq!(view.status, InvitationStatus::Pending);

        let after = f.store.find_invitation(invitation_id).await.unwrap().unwrap();
        assert_ne!(before.token, after.token);
        assert_eq!(f.notifier.deliveries().len(), 2);

        // The old token no longer finds a row
        let stale = f.registry.validate(&before.token, None).await.unwrap();
        assert_eq!(stale.reason, Some("INVITATION_NOT_FOUND"));

        f.registry.decline(&after.token).await.unwrap();
        assert!(matches!(
            f.registry.resend(Some(&f.owner_session), invitation_id).await,
            Err(DsError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_list_scopes_to_discussion_or_sender() {
        let f = fixture(None).await;
        f.link().await;
        f.link().await;

        let page = f
            .registry
            .list(
                Some(&f.owner_session),
                &ListInvitationsQuery {
                    discussion_id: Some(f.discussion.id),
                    status: None,
                    page: Some(1),
                    per_page: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.invitations.len(), 1);

        let (_, stranger) = f.session_for("arnold@example.com", "Arnold").await;
        let own = f
            .registry
            .list(
                Some(&stranger),
                &ListInvitationsQuery {
                    discussion_id: None,
                    status: None,
                    page: None,
                    per_page: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(own.total, 0);
        assert!(f.store.active_seat_count(f.discussion.id).await.unwrap() == 1);
    }

    #[test]
    fn test_is_valid_email() {
        assert!(is_valid_email("test@example.com"));
        assert!(is_valid_email("user+tag@sub.domain.com"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("test"));
        assert!(!is_valid_email("test@"));
        assert!(!is_valid_email("test@domain"));
        assert!(!is_valid_email("a b@example.com"));
        assert!(!is_valid_email("a@b@example.com"));
    }
}
