//! In-process store implementing every repository trait.
//!
//! All state sits behind one async mutex, so each trait method is atomic on
//! its own; that gives `reserve_seat` and `rotate_link_invitation` the same
//! all-or-nothing behaviour as their PostgreSQL transactions. Used by the
//! test suite and the test server harness.

use super::{
    AccountRepository, DiscussionRepository, InvitationRepository, MessageRepository,
    ParticipantRepository,
};
use crate::errors::DsError;
use crate::models::{
    Account, Admission, Discussion, DiscussionParticipant, Invitation, InvitationFilter,
    InvitationKind, InvitationStatus, MembershipStatus, MemberRole, Message, NewMessage,
    ParentFilter, Participant, ReactionCount, Redemption, RosterEntry, Seat, SeatRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{AccountId, DiscussionId, InvitationId, MessageId, ParticipantId};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    discussions: HashMap<DiscussionId, Discussion>,
    invitations: HashMap<InvitationId, Invitation>,
    participants: HashMap<ParticipantId, Participant>,
    memberships: HashMap<(DiscussionId, AccountId), DiscussionParticipant>,
    /// Append order; `seq` is index + 1.
    messages: Vec<Message>,
    /// (message, reactor, symbol) in insertion order.
    reactions: Vec<(MessageId, String, String)>,
}

impl State {
    fn seat_count(&self, discussion_id: DiscussionId) -> i64 {
        let members = self
            .memberships
            .values()
            .filter(|m| m.discussion_id == discussion_id && m.is_active())
            .count();
        let anonymous = self
            .participants
            .values()
            .filter(|p| p.discussion_id == discussion_id && p.is_present())
            .count();
        i64::try_from(members + anonymous).unwrap_or(i64::MAX)
    }

    fn ensure_room(&self, discussion: &Discussion) -> Result<(), DsError> {
        if discussion.has_room_for_one_more(self.seat_count(discussion.id)) {
            Ok(())
        } else {
            Err(DsError::DiscussionFull)
        }
    }

    fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    fn reaction_counts_for(&self, message_id: MessageId) -> Vec<ReactionCount> {
        let mut counts: Vec<ReactionCount> = Vec::new();
        for (_, _, symbol) in self.reactions.iter().filter(|(m, _, _)| *m == message_id) {
            match counts.iter_mut().find(|c| &c.symbol == symbol) {
                Some(entry) => entry.count += 1,
                None => counts.push(ReactionCount {
                    symbol: symbol.clone(),
                    count: 1,
                }),
            }
        }
        counts
    }

    /// Seat reservation without side effects on failure: every check runs
    /// before the first write.
    fn reserve(
        &mut self,
        discussion: &Discussion,
        request: &SeatRequest,
        redemption: Option<Redemption>,
    ) -> Result<Admission, DsError> {
        let now = Utc::now();

        // Decide what would happen, then validate the redemption, then write
        let plan = match request {
            SeatRequest::Anonymous {
                display_name,
                session_id,
            } => {
                let existing = self
                    .participants
                    .values()
                    .find(|p| {
                        p.discussion_id == discussion.id
                            && p.is_present()
                            && &p.session_id == session_id
                    })
                    .map(|p| p.id);
                match existing {
                    Some(id) => Plan::ReuseAnonymous(id, display_name.clone()),
                    None => {
                        self.ensure_room(discussion)?;
                        Plan::InsertAnonymous(display_name.clone(), session_id.clone())
                    }
                }
            }
            SeatRequest::Member {
                account_id,
                display_name,
                role,
            } => match self.memberships.get(&(discussion.id, *account_id)) {
                Some(m) if m.is_active() => Plan::ReuseMember(*account_id),
                Some(m) if m.status == MembershipStatus::Removed => {
                    return Err(DsError::Forbidden(
                        "You have been removed from this discussion".to_string(),
                    ));
                }
                Some(_) => {
                    self.ensure_room(discussion)?;
                    Plan::ReactivateMember(*account_id, display_name.clone())
                }
                None => {
                    self.ensure_room(discussion)?;
                    Plan::InsertMember(*account_id, display_name.clone(), *role)
                }
            },
            SeatRequest::Registration { account } => {
                let email_taken = self
                    .accounts
                    .values()
                    .any(|a| a.email.eq_ignore_ascii_case(&account.email));
                if email_taken {
                    return Err(DsError::Conflict(
                        "An account with this email already exists".to_string(),
                    ));
                }
                self.ensure_room(discussion)?;
                Plan::Register(account.clone())
            }
        };

        let newly_admitted = plan.admits_new_seat();

        if let Some(redemption) = redemption {
            let invitation = self.invitations.get(&redemption.invitation_id);
            match redemption.kind {
                InvitationKind::Link if newly_admitted => {
                    let usable = invitation.is_some_and(|inv| {
                        inv.status == InvitationStatus::Pending && !inv.is_exhausted()
                    });
                    if !usable {
                        return Err(DsError::InvitationExhausted);
                    }
                }
                // Once accepted, an email invitation only lets existing seats back in
                InvitationKind::Email if plan.creates_seat() => {
                    if !invitation.is_some_and(|inv| inv.status == InvitationStatus::Pending) {
                        return Err(DsError::InvitationRevokedOrCancelled);
                    }
                }
                InvitationKind::Link | InvitationKind::Email => {}
            }
        }

        let admission = match plan {
            Plan::ReuseAnonymous(id, display_name) => {
                let participant = self
                    .participants
                    .get_mut(&id)
                    .ok_or(DsError::Internal)?;
                let renamed_from = (participant.display_name != display_name)
                    .then(|| std::mem::replace(&mut participant.display_name, display_name));
                Admission {
                    seat: Seat::Anonymous(participant.clone()),
                    newly_admitted: false,
                    renamed_from,
                }
            }
            Plan::InsertAnonymous(display_name, session_id) => {
                let participant = Participant {
                    id: ParticipantId::new(),
                    discussion_id: discussion.id,
                    display_name,
                    session_id,
                    joined_at: now,
                    left_at: None,
                };
                self.participants.insert(participant.id, participant.clone());
                Admission {
                    seat: Seat::Anonymous(participant),
                    newly_admitted: true,
                    renamed_from: None,
                }
            }
            Plan::ReuseMember(account_id) => {
                let membership = self
                    .memberships
                    .get(&(discussion.id, account_id))
                    .ok_or(DsError::Internal)?;
                Admission {
                    seat: Seat::Member(membership.clone()),
                    newly_admitted: false,
                    renamed_from: None,
                }
            }
            Plan::ReactivateMember(account_id, display_name) => {
                let membership = self
                    .memberships
                    .get_mut(&(discussion.id, account_id))
                    .ok_or(DsError::Internal)?;
                membership.status = MembershipStatus::Active;
                membership.display_name = display_name;
                membership.last_seen_at = Some(now);
                Admission {
                    seat: Seat::Member(membership.clone()),
                    newly_admitted: true,
                    renamed_from: None,
                }
            }
            Plan::Register(account) => {
                let membership = DiscussionParticipant {
                    discussion_id: discussion.id,
                    account_id: account.id,
                    display_name: account.display_name.clone(),
                    role: MemberRole::Member,
                    status: MembershipStatus::Active,
                    message_count: 0,
                    last_seen_at: Some(now),
                    joined_at: now,
                };
                self.accounts.insert(account.id, account);
                self.memberships
                    .insert((discussion.id, membership.account_id), membership.clone());
                Admission {
                    seat: Seat::Member(membership),
                    newly_admitted: true,
                    renamed_from: None,
                }
            }
            Plan::InsertMember(account_id, display_name, role) => {
                let membership = DiscussionParticipant {
                    discussion_id: discussion.id,
                    account_id,
                    display_name,
                    role,
                    status: MembershipStatus::Active,
                    message_count: 0,
                    last_seen_at: Some(now),
                    joined_at: now,
                };
                self.memberships
                    .insert((discussion.id, account_id), membership.clone());
                Admission {
                    seat: Seat::Member(membership),
                    newly_admitted: true,
                    renamed_from: None,
                }
            }
        };

        if let Some(redemption) = redemption {
            if let Some(invitation) = self.invitations.get_mut(&redemption.invitation_id) {
                match redemption.kind {
                    InvitationKind::Link if newly_admitted => invitation.use_count += 1,
                    InvitationKind::Link => {}
                    InvitationKind::Email => {
                        if invitation.status == InvitationStatus::Pending {
                            invitation.status = InvitationStatus::Accepted;
                            invitation.responded_at = Some(now);
                        }
                    }
                }
            }
        }

        Ok(admission)
    }
}

enum Plan {
    ReuseAnonymous(ParticipantId, String),
    InsertAnonymous(String, String),
    ReuseMember(AccountId),
    ReactivateMember(AccountId, String),
    InsertMember(AccountId, String, MemberRole),
    Register(Account),
}

impl Plan {
    fn admits_new_seat(&self) -> bool {
        !matches!(self, Plan::ReuseAnonymous(..) | Plan::ReuseMember(_))
    }

    /// A seat with no earlier row behind it.
    fn creates_seat(&self) -> bool {
        matches!(
            self,
            Plan::InsertAnonymous(..) | Plan::InsertMember(..) | Plan::Register(_)
        )
    }
}

/// In-memory [`Store`](super::Store).
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscussionRepository for MemoryStore {
    async fn ping(&self) -> Result<(), DsError> {
        Ok(())
    }

    async fn insert_discussion(
        &self,
        discussion: &Discussion,
        owner_display_name: &str,
    ) -> Result<(), DsError> {
        let mut state = self.state.lock().await;
        if state.discussions.contains_key(&discussion.id) {
            return Err(DsError::Conflict("Discussion already exists".to_string()));
        }
        state.discussions.insert(discussion.id, discussion.clone());
        state.memberships.insert(
            (discussion.id, discussion.owner_id),
            DiscussionParticipant {
                discussion_id: discussion.id,
                account_id: discussion.owner_id,
                display_name: owner_display_name.to_string(),
                role: MemberRole::Owner,
                status: MembershipStatus::Active,
                message_count: 0,
                last_seen_at: None,
                joined_at: discussion.created_at,
            },
        );
        Ok(())
    }

    async fn get_discussion(&self, id: DiscussionId) -> Result<Option<Discussion>, DsError> {
        Ok(self.state.lock().await.discussions.get(&id).cloned())
    }

    async fn close_discussion(&self, id: DiscussionId, at: DateTime<Utc>) -> Result<bool, DsError> {
        let mut state = self.state.lock().await;
        match state.discussions.get_mut(&id) {
            Some(discussion) if discussion.closed_at.is_none() => {
                discussion.closed_at = Some(at);
                discussion.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_seat_count(&self, id: DiscussionId) -> Result<i64, DsError> {
        Ok(self.state.lock().await.seat_count(id))
    }
}

#[async_trait]
impl InvitationRepository for MemoryStore {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), DsError> {
        let mut state = self.state.lock().await;
        if state.invitations.values().any(|i| i.token == invitation.token) {
            return Err(DsError::Conflict(
                "Invitation token already exists".to_string(),
            ));
        }
        state.invitations.insert(invitation.id, invitation.clone());
        Ok(())
    }

    async fn rotate_link_invitation(&self, invitation: &Invitation) -> Result<(), DsError> {
        let mut state = self.state.lock().await;
        if state.invitations.values().any(|i| i.token == invitation.token) {
            return Err(DsError::Conflict(
                "Invitation token already exists".to_string(),
            ));
        }
        let discussion = state
            .discussions
            .get_mut(&invitation.discussion_id)
            .ok_or(DsError::DiscussionNotFound)?;
        discussion.current_invitation_token = Some(invitation.token.clone());
        state.invitations.insert(invitation.id, invitation.clone());
        Ok(())
    }

    async fn find_invitation(&self, id: InvitationId) -> Result<Option<Invitation>, DsError> {
        Ok(self.state.lock().await.invitations.get(&id).cloned())
    }

    async fn find_invitation_by_token(&self, token: &str) -> Result<Option<Invitation>, DsError> {
        Ok(self
            .state
            .lock()
            .await
            .invitations
            .values()
            .find(|i| i.token == token)
            .cloned())
    }

    async fn find_pending_email_invitation(
        &self,
        discussion_id: DiscussionId,
        email: &str,
    ) -> Result<Option<Invitation>, DsError> {
        Ok(self
            .state
            .lock()
            .await
            .invitations
            .values()
            .filter(|i| {
                i.discussion_id == discussion_id
                    && i.kind == InvitationKind::Email
                    && i.status == InvitationStatus::Pending
                    && i.recipient_email == email
            })
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn decline_invitation(
        &self,
        id: InvitationId,
        at: DateTime<Utc>,
    ) -> Result<bool, DsError> {
        let mut state = self.state.lock().await;
        match state.invitations.get_mut(&id) {
            Some(invitation) if invitation.status == InvitationStatus::Pending => {
                invitation.status = InvitationStatus::Declined;
                invitation.responded_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_invitation(&self, id: InvitationId, at: DateTime<Utc>) -> Result<bool, DsError> {
        let mut state = self.state.lock().await;
        let (discussion_id, token) = match state.invitations.get_mut(&id) {
            Some(invitation) if invitation.status == InvitationStatus::Pending => {
                invitation.status = InvitationStatus::Cancelled;
                invitation.responded_at = Some(at);
                (invitation.discussion_id, invitation.token.clone())
            }
            _ => return Ok(false),
        };

        if let Some(discussion) = state.discussions.get_mut(&discussion_id) {
            if discussion.current_invitation_token.as_deref() == Some(token.as_str()) {
                discussion.current_invitation_token = None;
            }
        }
        Ok(true)
    }

    async fn refresh_invitation(
        &self,
        id: InvitationId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DsError> {
        let mut state = self.state.lock().await;
        match state.invitations.get_mut(&id) {
            Some(invitation) if invitation.status == InvitationStatus::Pending => {
                invitation.token = token.to_string();
                invitation.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_invitations(
        &self,
        filter: &InvitationFilter,
    ) -> Result<(Vec<Invitation>, i64), DsError> {
        let state = self.state.lock().await;
        let mut matching: Vec<&Invitation> = state
            .invitations
            .values()
            .filter(|i| filter.sender_id.map_or(true, |s| i.sender_id == s))
            .filter(|i| filter.discussion_id.map_or(true, |d| i.discussion_id == d))
            .filter(|i| filter.status.map_or(true, |s| i.status == s))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = i64::try_from(matching.len()).unwrap_or(i64::MAX);
        let offset = usize::try_from(filter.offset).unwrap_or(0);
        let limit = usize::try_from(filter.limit).unwrap_or(0);
        let page = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn expire_invitations(&self, now: DateTime<Utc>) -> Result<u64, DsError> {
        let mut state = self.state.lock().await;
        let mut expired = 0;
        for invitation in state.invitations.values_mut() {
            if invitation.status == InvitationStatus::Pending && invitation.is_expired_at(now) {
                invitation.status = InvitationStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl ParticipantRepository for MemoryStore {
    async fn reserve_seat(
        &self,
        discussion_id: DiscussionId,
        request: &SeatRequest,
        redemption: Option<Redemption>,
    ) -> Result<Admission, DsError> {
        let mut state = self.state.lock().await;
        let discussion = state
            .discussions
            .get(&discussion_id)
            .cloned()
            .ok_or(DsError::DiscussionNotFound)?;
        if !discussion.is_open() {
            return Err(DsError::DiscussionInactive);
        }
        state.reserve(&discussion, request, redemption)
    }

    async fn find_participant(&self, id: ParticipantId) -> Result<Option<Participant>, DsError> {
        Ok(self.state.lock().await.participants.get(&id).cloned())
    }

    async fn find_membership(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
    ) -> Result<Option<DiscussionParticipant>, DsError> {
        Ok(self
            .state
            .lock()
            .await
            .memberships
            .get(&(discussion_id, account_id))
            .cloned())
    }

    async fn leave_participant(
        &self,
        id: ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<bool, DsError> {
        let mut state = self.state.lock().await;
        match state.participants.get_mut(&id) {
            Some(participant) if participant.left_at.is_none() => {
                participant.left_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn leave_membership(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
    ) -> Result<bool, DsError> {
        let mut state = self.state.lock().await;
        match state.memberships.get_mut(&(discussion_id, account_id)) {
            Some(membership) if membership.is_active() => {
                membership.status = MembershipStatus::Left;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn roster(&self, discussion_id: DiscussionId) -> Result<Vec<RosterEntry>, DsError> {
        let state = self.state.lock().await;
        let mut roster: Vec<RosterEntry> = state
            .memberships
            .values()
            .filter(|m| m.discussion_id == discussion_id && m.is_active())
            .map(RosterEntry::from)
            .chain(
                state
                    .participants
                    .values()
                    .filter(|p| p.discussion_id == discussion_id && p.is_present())
                    .map(RosterEntry::from),
            )
            .collect();
        roster.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
        Ok(roster)
    }

    async fn record_member_activity(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<(), DsError> {
        let mut state = self.state.lock().await;
        if let Some(membership) = state.memberships.get_mut(&(discussion_id, account_id)) {
            membership.message_count += 1;
            membership.last_seen_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn insert_message(&self, message: &NewMessage) -> Result<Message, DsError> {
        let mut state = self.state.lock().await;
        let seq = i64::try_from(state.messages.len()).unwrap_or(i64::MAX) + 1;
        let stored = Message {
            id: message.id,
            seq,
            discussion_id: message.discussion_id,
            author_account_id: message.sender.account_id(),
            author_participant_id: message.sender.participant_id(),
            sender_name: message.sender.display_name().to_string(),
            sender_kind: message.sender.kind(),
            content: message.content.clone(),
            parent_id: message.parent_id,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            created_at: Utc::now(),
        };
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, DsError> {
        Ok(self
            .state
            .lock()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn page_messages(
        &self,
        discussion_id: DiscussionId,
        filter: ParentFilter,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>, DsError> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|m| m.discussion_id == discussion_id)
            .filter(|m| before_seq.map_or(true, |before| m.seq < before))
            .filter(|m| filter.matches(m.parent_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn messages_after(
        &self,
        discussion_id: DiscussionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Message>, DsError> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state
            .messages
            .iter()
            .filter(|m| m.discussion_id == discussion_id && m.seq > after_seq)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_seq(&self, discussion_id: DiscussionId) -> Result<i64, DsError> {
        Ok(self
            .state
            .lock()
            .await
            .messages
            .iter()
            .rev()
            .find(|m| m.discussion_id == discussion_id)
            .map_or(0, |m| m.seq))
    }

    async fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, DsError> {
        let mut state = self.state.lock().await;
        Ok(state.message_mut(id).filter(|m| !m.is_deleted).map(|m| {
            m.content = content.to_string();
            m.is_edited = true;
            m.edited_at = Some(at);
            m.clone()
        }))
    }

    async fn mark_message_deleted(
        &self,
        id: MessageId,
        _at: DateTime<Utc>,
    ) -> Result<Option<Message>, DsError> {
        let mut state = self.state.lock().await;
        Ok(state.message_mut(id).map(|m| {
            m.is_deleted = true;
            m.clone()
        }))
    }

    async fn toggle_reaction(
        &self,
        message_id: MessageId,
        reactor_key: &str,
        symbol: &str,
    ) -> Result<Vec<ReactionCount>, DsError> {
        let mut state = self.state.lock().await;
        let before = state.reactions.len();
        state
            .reactions
            .retain(|(m, r, s)| !(*m == message_id && r == reactor_key && s == symbol));
        if state.reactions.len() == before {
            state
                .reactions
                .push((message_id, reactor_key.to_string(), symbol.to_string()));
        }
        Ok(state.reaction_counts_for(message_id))
    }

    async fn reaction_counts(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<ReactionCount>>, DsError> {
        let state = self.state.lock().await;
        Ok(message_ids
            .iter()
            .map(|id| (*id, state.reaction_counts_for(*id)))
            .filter(|(_, counts)| !counts.is_empty())
            .collect())
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn find_account(&self, id: AccountId) -> Result<Option<Account>, DsError> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, DsError> {
        Ok(self
            .state
            .lock()
            .await
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create_account(
        &self,
        email: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<Account, DsError> {
        let mut state = self.state.lock().await;
        if state
            .accounts
            .values()
            .any(|a| a.email.eq_ignore_ascii_case(email))
        {
            return Err(DsError::Conflict(
                "An account with this email already exists".to_string(),
            ));
        }
        let account = Account {
            id: AccountId::new(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            password_hash: Some(password_hash.to_string()),
            created_at: Utc::now(),
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }
}
