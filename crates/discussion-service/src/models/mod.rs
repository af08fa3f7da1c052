//! Data models for the discussion service.
//!
//! Domain records mirror the tables in `migrations/`. Wire request/response
//! types live in [`api`].

pub mod api;

use chrono::{DateTime, Utc};
use common::types::{AccountId, DiscussionId, InvitationId, MessageId, ParticipantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Enum stored as lowercase text in the database and serialized as
/// SCREAMING_SNAKE_CASE on the wire.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Database representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Email-addressed invitation or open shareable link.
    InvitationKind { Email => "email", Link => "link" }
);

text_enum!(
    /// Invitation lifecycle. PENDING moves to exactly one terminal state.
    InvitationStatus {
        Pending => "pending",
        Accepted => "accepted",
        Declined => "declined",
        Expired => "expired",
        Cancelled => "cancelled",
    }
);

text_enum!(
    /// Role of an authenticated member within a discussion.
    MemberRole { Owner => "owner", Moderator => "moderator", Member => "member" }
);

text_enum!(
    MembershipStatus { Active => "active", Left => "left", Removed => "removed" }
);

text_enum!(
    /// Denormalized sender classification stored on every message.
    SenderKind {
        User => "user",
        Participant => "participant",
        System => "system",
        Moderator => "moderator",
        Ai => "ai",
    }
);

impl InvitationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvitationStatus::Pending)
    }
}

impl MemberRole {
    /// Owners and moderators manage invitations and may delete any message.
    pub fn can_moderate(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Moderator)
    }
}

// ============================================================================
// Discussions
// ============================================================================

/// A discussion handed to this service once active.
#[derive(Clone)]
pub struct Discussion {
    pub id: DiscussionId,
    pub title: String,
    pub owner_id: AccountId,
    pub is_active: bool,
    pub closed_at: Option<DateTime<Utc>>,
    /// `None` means unlimited.
    pub max_participants: Option<i32>,
    /// The single active link token; rotation overwrites it.
    pub current_invitation_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Discussion {
    pub fn new(title: impl Into<String>, owner_id: AccountId, max_participants: Option<i32>) -> Self {
        Self {
            id: DiscussionId::new(),
            title: title.into(),
            owner_id,
            is_active: true,
            closed_at: None,
            max_participants,
            current_invitation_token: None,
            created_at: Utc::now(),
        }
    }

    /// A closed or inactive discussion accepts no joins and no messages.
    pub fn is_open(&self) -> bool {
        self.is_active && self.closed_at.is_none()
    }

    /// Whether one more seat fits given `active` occupied seats.
    pub fn has_room_for_one_more(&self, active: i64) -> bool {
        match self.max_participants {
            Some(max) => active < i64::from(max),
            None => true,
        }
    }
}

impl fmt::Debug for Discussion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discussion")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("owner_id", &self.owner_id)
            .field("is_active", &self.is_active)
            .field("closed_at", &self.closed_at)
            .field("max_participants", &self.max_participants)
            .field(
                "current_invitation_token",
                &self.current_invitation_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

// ============================================================================
// Invitations
// ============================================================================

/// Durable invitation record, email-addressed or link-based.
#[derive(Clone)]
pub struct Invitation {
    pub id: InvitationId,
    pub kind: InvitationKind,
    pub discussion_id: DiscussionId,
    /// Empty for link invitations.
    pub recipient_email: String,
    pub recipient_account_id: Option<AccountId>,
    pub sender_id: AccountId,
    pub status: InvitationStatus,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub max_uses: Option<i32>,
    pub use_count: i32,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.use_count >= max)
    }

    pub fn remaining_uses(&self) -> Option<i32> {
        self.max_uses.map(|max| (max - self.use_count).max(0))
    }
}

impl fmt::Debug for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invitation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("discussion_id", &self.discussion_id)
            .field("recipient_account_id", &self.recipient_account_id)
            .field("status", &self.status)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("max_uses", &self.max_uses)
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}

/// Filters for listing invitations.
#[derive(Debug, Clone, Default)]
pub struct InvitationFilter {
    pub sender_id: Option<AccountId>,
    pub discussion_id: Option<DiscussionId>,
    pub status: Option<InvitationStatus>,
    pub limit: i64,
    pub offset: i64,
}

// ============================================================================
// Participants
// ============================================================================

/// Anonymous participant admitted through an invitation token.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub discussion_id: DiscussionId,
    pub display_name: String,
    /// Client-chosen; distinguishes a resubmission from a new joiner.
    pub session_id: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_present(&self) -> bool {
        self.left_at.is_none()
    }
}

/// Authenticated account membership in a discussion.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscussionParticipant {
    pub discussion_id: DiscussionId,
    pub account_id: AccountId,
    pub display_name: String,
    pub role: MemberRole,
    pub status: MembershipStatus,
    pub message_count: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

impl DiscussionParticipant {
    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }
}

/// A seat the capacity guard is asked to grant.
#[derive(Debug, Clone)]
pub enum SeatRequest {
    Anonymous {
        display_name: String,
        session_id: String,
    },
    Member {
        account_id: AccountId,
        display_name: String,
        role: MemberRole,
    },
    /// An account created together with its first membership. Nothing is
    /// written when the seat is refused.
    Registration { account: Account },
}

/// Invitation bookkeeping applied in the same transaction as the seat.
#[derive(Debug, Clone, Copy)]
pub struct Redemption {
    pub invitation_id: InvitationId,
    pub kind: InvitationKind,
}

/// The row that now holds the seat.
#[derive(Debug, Clone)]
pub enum Seat {
    Anonymous(Participant),
    Member(DiscussionParticipant),
}

impl Seat {
    pub fn display_name(&self) -> &str {
        match self {
            Seat::Anonymous(p) => &p.display_name,
            Seat::Member(m) => &m.display_name,
        }
    }

    pub fn roster_entry(&self) -> RosterEntry {
        match self {
            Seat::Anonymous(p) => RosterEntry::from(p),
            Seat::Member(m) => RosterEntry::from(m),
        }
    }
}

/// Outcome of a successful seat reservation.
#[derive(Debug, Clone)]
pub struct Admission {
    pub seat: Seat,
    /// `false` when an existing open row was reused.
    pub newly_admitted: bool,
    /// Previous display name when a rejoin renamed the seat.
    pub renamed_from: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantKind {
    Account,
    Anonymous,
}

/// One present participant as shown in stream snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub id: Uuid,
    pub kind: ParticipantKind,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<MemberRole>,
    pub joined_at: DateTime<Utc>,
}

impl From<&Participant> for RosterEntry {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id.as_uuid(),
            kind: ParticipantKind::Anonymous,
            display_name: p.display_name.clone(),
            role: None,
            joined_at: p.joined_at,
        }
    }
}

impl From<&DiscussionParticipant> for RosterEntry {
    fn from(m: &DiscussionParticipant) -> Self {
        Self {
            id: m.account_id.as_uuid(),
            kind: ParticipantKind::Account,
            display_name: m.display_name.clone(),
            role: Some(m.role),
            joined_at: m.joined_at,
        }
    }
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Clone)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub display_name: String,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("password_hash", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Who wrote a message, resolved once at append time.
#[derive(Debug, Clone, PartialEq)]
pub enum Sender {
    Account {
        account_id: AccountId,
        display_name: String,
        role: MemberRole,
    },
    Anonymous {
        participant_id: ParticipantId,
        display_name: String,
    },
    System,
    Ai {
        persona: String,
    },
}

impl Sender {
    pub fn kind(&self) -> SenderKind {
        match self {
            Sender::Account { role, .. } if role.can_moderate() => SenderKind::Moderator,
            Sender::Account { .. } => SenderKind::User,
            Sender::Anonymous { .. } => SenderKind::Participant,
            Sender::System => SenderKind::System,
            Sender::Ai { .. } => SenderKind::Ai,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Sender::Account { display_name, .. } | Sender::Anonymous { display_name, .. } => {
                display_name
            }
            Sender::System => "System",
            Sender::Ai { persona } => persona,
        }
    }

    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            Sender::Account { account_id, .. } => Some(*account_id),
            _ => None,
        }
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        match self {
            Sender::Anonymous { participant_id, .. } => Some(*participant_id),
            _ => None,
        }
    }
}

/// A message to append.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub discussion_id: DiscussionId,
    pub sender: Sender,
    pub content: String,
    pub parent_id: Option<MessageId>,
}

/// A stored message. `seq` is the store-assigned append order.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub seq: i64,
    pub discussion_id: DiscussionId,
    pub author_account_id: Option<AccountId>,
    pub author_participant_id: Option<ParticipantId>,
    pub sender_name: String,
    pub sender_kind: SenderKind,
    pub content: String,
    pub parent_id: Option<MessageId>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Which messages a page covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentFilter {
    #[default]
    Any,
    TopLevel,
    RepliesTo(MessageId),
}

impl ParentFilter {
    pub fn matches(&self, parent_id: Option<MessageId>) -> bool {
        match self {
            ParentFilter::Any => true,
            ParentFilter::TopLevel => parent_id.is_none(),
            ParentFilter::RepliesTo(id) => parent_id == Some(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionCount {
    pub symbol: String,
    pub count: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_round_trips_database_text() {
        for status in [
            InvitationStatus::Pending,
            InvitationStatus::Accepted,
            InvitationStatus::Declined,
            InvitationStatus::Expired,
            InvitationStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<InvitationStatus>().unwrap(), status);
        }
        assert!("PENDING".parse::<InvitationStatus>().is_err());
    }

    #[test]
    fn test_wire_format_is_screaming_case() {
        assert_eq!(
            serde_json::to_string(&InvitationStatus::Cancelled).unwrap(),
            "\"CANCELLED\""
        );
        assert_eq!(serde_json::to_string(&SenderKind::Ai).unwrap(), "\"AI\"");
    }

    #[test]
    fn test_sender_kind_resolution() {
        let account_id = AccountId::new();
        let moderator = Sender::Account {
            account_id,
            display_name: "Ms. Frizzle".to_string(),
            role: MemberRole::Owner,
        };
        let member = Sender::Account {
            account_id,
            display_name: "Arnold".to_string(),
            role: MemberRole::Member,
        };
        let guest = Sender::Anonymous {
            participant_id: ParticipantId::new(),
            display_name: "Bob".to_string(),
        };

        assert_eq!(moderator.kind(), SenderKind::Moderator);
        assert_eq!(member.kind(), SenderKind::User);
        assert_eq!(guest.kind(), SenderKind::Participant);
        assert_eq!(Sender::System.kind(), SenderKind::System);
        assert_eq!(Sender::System.display_name(), "System");
        assert_eq!(
            Sender::Ai {
                persona: "Socrates".to_string()
            }
            .display_name(),
            "Socrates"
        );
        assert_eq!(guest.account_id(), None);
        assert!(guest.participant_id().is_some());
    }

    #[test]
    fn test_discussion_capacity() {
        let mut discussion = Discussion::new("Photosynthesis", AccountId::new(), Some(3));
        assert!(discussion.has_room_for_one_more(2));
        assert!(!discussion.has_room_for_one_more(3));

        discussion.max_participants = None;
        assert!(discussion.has_room_for_one_more(10_000));

        assert!(discussion.is_open());
        discussion.closed_at = Some(Utc::now());
        assert!(!discussion.is_open());
    }

    #[test]
    fn test_invitation_debug_redacts_token() {
        let now = Utc::now();
        let invitation = Invitation {
            id: InvitationId::new(),
            kind: InvitationKind::Link,
            discussion_id: DiscussionId::new(),
            recipient_email: String::new(),
            recipient_account_id: None,
            sender_id: AccountId::new(),
            status: InvitationStatus::Pending,
            token: "eyJ.secret.sig".to_string(),
            expires_at: now,
            max_uses: Some(2),
            use_count: 2,
            responded_at: None,
            created_at: now,
        };

        assert!(!format!("{invitation:?}").contains("eyJ.secret.sig"));
        assert!(invitation.is_exhausted());
        assert_eq!(invitation.remaining_uses(), Some(0));
        assert!(invitation.is_expired_at(now));
    }

    #[test]
    fn test_parent_filter() {
        let parent = MessageId::new();
        assert!(ParentFilter::Any.matches(Some(parent)));
        assert!(ParentFilter::TopLevel.matches(None));
        assert!(!ParentFilter::TopLevel.matches(Some(parent)));
        assert!(ParentFilter::RepliesTo(parent).matches(Some(parent)));
        assert!(!ParentFilter::RepliesTo(parent).matches(None));
    }
}
