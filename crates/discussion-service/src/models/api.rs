//! Request and response bodies for the HTTP API.

use super::{
    Discussion, Invitation, InvitationKind, InvitationStatus, MemberRole, Message, ParticipantKind,
    ReactionCount, Seat, SenderKind,
};
use crate::errors::DsError;
use chrono::{DateTime, Utc};
use common::types::{AccountId, DiscussionId, InvitationId, MessageId, ParticipantId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Maximum recipients per `sendInvitations` call.
pub const MAX_RECIPIENTS: usize = 50;

/// Longest TTL a caller may request, in days.
pub const MAX_TTL_DAYS: u32 = 30;

/// Display name bounds (characters, after trimming).
pub const MIN_DISPLAY_NAME_CHARS: usize = 2;
pub const MAX_DISPLAY_NAME_CHARS: usize = 100;

/// Session id bounds.
pub const MAX_SESSION_ID_CHARS: usize = 128;

/// Minimum password length for new accounts.
pub const MIN_PASSWORD_CHARS: usize = 8;

/// Convert an optional `ttlDays` field, enforcing 1..=30.
pub fn ttl_from_days(days: Option<u32>) -> Result<Option<Duration>, DsError> {
    match days {
        None => Ok(None),
        Some(d) if (1..=MAX_TTL_DAYS).contains(&d) => {
            Ok(Some(Duration::from_secs(u64::from(d) * 24 * 3600)))
        }
        Some(d) => Err(DsError::BadRequest(format!(
            "ttlDays must be between 1 and {}, got {}",
            MAX_TTL_DAYS, d
        ))),
    }
}

/// Trim and bound-check a display name.
pub fn normalize_display_name(raw: &str) -> Result<String, DsError> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if !(MIN_DISPLAY_NAME_CHARS..=MAX_DISPLAY_NAME_CHARS).contains(&len) {
        return Err(DsError::BadRequest(format!(
            "displayName must be {} to {} characters",
            MIN_DISPLAY_NAME_CHARS, MAX_DISPLAY_NAME_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

pub fn validate_session_id(raw: &str) -> Result<String, DsError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_SESSION_ID_CHARS {
        return Err(DsError::BadRequest(format!(
            "sessionId must be 1 to {} characters",
            MAX_SESSION_ID_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

// ============================================================================
// Invitations
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInvitationsRequest {
    pub recipients: Vec<String>,
    #[serde(default)]
    pub ttl_days: Option<u32>,
}

impl SendInvitationsRequest {
    pub fn validate(&self) -> Result<Option<Duration>, DsError> {
        if self.recipients.is_empty() || self.recipients.len() > MAX_RECIPIENTS {
            return Err(DsError::BadRequest(format!(
                "recipients must contain 1 to {} addresses",
                MAX_RECIPIENTS
            )));
        }
        ttl_from_days(self.ttl_days)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkRequest {
    #[serde(default)]
    pub ttl_days: Option<u32>,
    #[serde(default)]
    pub max_uses: Option<i32>,
}

impl CreateLinkRequest {
    pub fn validate(&self) -> Result<Option<Duration>, DsError> {
        if let Some(max_uses) = self.max_uses {
            if max_uses < 1 {
                return Err(DsError::BadRequest(
                    "maxUses must be at least 1".to_string(),
                ));
            }
        }
        ttl_from_days(self.ttl_days)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Sent,
    AlreadyInvited,
    AlreadyMember,
    InvalidEmail,
    DeliveryFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientOutcome {
    pub email: String,
    pub status: RecipientStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invitation_id: Option<InvitationId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendInvitationsResponse {
    pub results: Vec<RecipientOutcome>,
    pub sent: usize,
}

/// Invitation as shown to its sender.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationView {
    pub id: InvitationId,
    pub kind: InvitationKind,
    pub discussion_id: DiscussionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<i32>,
    pub use_count: i32,
    pub url: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl InvitationView {
    pub fn new(invitation: &Invitation, public_base_url: &str) -> Self {
        Self {
            id: invitation.id,
            kind: invitation.kind,
            discussion_id: invitation.discussion_id,
            recipient_email: (!invitation.recipient_email.is_empty())
                .then(|| invitation.recipient_email.clone()),
            status: invitation.status,
            expires_at: invitation.expires_at,
            max_uses: invitation.max_uses,
            use_count: invitation.use_count,
            url: invite_url(public_base_url, &invitation.token),
            created_at: invitation.created_at,
            responded_at: invitation.responded_at,
        }
    }
}

pub fn invite_url(public_base_url: &str, token: &str) -> String {
    format!("{}/invite/{}", public_base_url, token)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInvitationResponse {
    pub invitation: InvitationView,
    pub token: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInvitationsQuery {
    #[serde(default)]
    pub discussion_id: Option<DiscussionId>,
    #[serde(default)]
    pub status: Option<InvitationStatus>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationPage {
    pub invitations: Vec<InvitationView>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

/// Public view of the discussion behind a token.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionSummary {
    pub id: DiscussionId,
    pub title: String,
    pub is_open: bool,
    pub participant_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_participants: Option<i32>,
}

impl DiscussionSummary {
    pub fn new(discussion: &Discussion, participant_count: i64) -> Self {
        Self {
            id: discussion.id,
            title: discussion.title.clone(),
            is_open: discussion.is_open(),
            participant_count,
            max_participants: discussion.max_participants,
        }
    }
}

/// Result of `validate(token)`. `reason` is the stable error code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationValidity {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discussion: Option<DiscussionSummary>,
}

impl InvitationValidity {
    pub fn valid(discussion: DiscussionSummary) -> Self {
        Self {
            valid: true,
            reason: None,
            message: None,
            discussion: Some(discussion),
        }
    }

    pub fn invalid(error: &DsError) -> Self {
        Self {
            valid: false,
            reason: Some(error.code()),
            message: Some(error.to_string()),
            discussion: None,
        }
    }
}

/// Result of `getByToken(token)`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationLookup {
    #[serde(flatten)]
    pub validity: InvitationValidity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<InvitationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<InvitationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    /// From the token itself, so it is known even for unverifiable tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_uses: Option<i32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountRequest {
    pub email: String,
    pub display_name: String,
    pub password: String,
}

impl fmt::Debug for NewAccountRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccountRequest")
            .field("display_name", &self.display_name)
            .field("password", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptInvitationRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub new_account: Option<NewAccountRequest>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclineResponse {
    pub id: InvitationId,
    pub status: InvitationStatus,
}

// ============================================================================
// Join
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// The caller's seat after a join.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: Uuid,
    pub kind: ParticipantKind,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<MemberRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl From<&Seat> for ParticipantView {
    fn from(seat: &Seat) -> Self {
        match seat {
            Seat::Anonymous(p) => Self {
                id: p.id.as_uuid(),
                kind: ParticipantKind::Anonymous,
                display_name: p.display_name.clone(),
                role: None,
                session_id: Some(p.session_id.clone()),
                joined_at: p.joined_at,
            },
            Seat::Member(m) => Self {
                id: m.account_id.as_uuid(),
                kind: ParticipantKind::Account,
                display_name: m.display_name.clone(),
                role: Some(m.role),
                session_id: None,
                joined_at: m.joined_at,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub participant: ParticipantView,
    pub discussion: DiscussionSummary,
    pub messages: MessagePage,
    /// `false` when an existing seat was reused.
    pub newly_joined: bool,
    /// Present when the join created an account (auto-login).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveResponse {
    pub left: bool,
}

// ============================================================================
// Messages
// ============================================================================

/// Anonymous credentials as query parameters (EventSource cannot set headers).
#[derive(Debug, Default, Deserialize)]
pub struct CredentialQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub participant_id: Option<ParticipantId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub symbol: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub is_typing: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default, alias = "parent_id")]
    pub parent_id: Option<MessageId>,
    #[serde(default, alias = "top_level")]
    pub top_level: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: MessageId,
    pub discussion_id: DiscussionId,
    pub sender_name: String,
    pub sender_kind: SenderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_account_id: Option<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_participant_id: Option<ParticipantId>,
    /// Empty once the message is deleted.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    pub is_edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionCount>,
}

impl MessageView {
    pub fn new(message: &Message, reactions: Vec<ReactionCount>) -> Self {
        Self {
            id: message.id,
            discussion_id: message.discussion_id,
            sender_name: message.sender_name.clone(),
            sender_kind: message.sender_kind,
            author_account_id: message.author_account_id,
            author_participant_id: message.author_participant_id,
            content: if message.is_deleted {
                String::new()
            } else {
                message.content.clone()
            },
            parent_id: message.parent_id,
            is_edited: message.is_edited,
            edited_at: message.edited_at,
            is_deleted: message.is_deleted,
            created_at: message.created_at,
            reactions,
        }
    }
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        Self::new(message, Vec::new())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    /// Newest first.
    pub messages: Vec<MessageView>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionsResponse {
    pub message_id: MessageId,
    pub reactions: Vec<ReactionCount>,
}

// ============================================================================
// Operational
// ============================================================================

/// Returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// "healthy" or "unhealthy".
    pub status: String,

    /// Database connectivity ("healthy" or "unhealthy").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// "push" or "poll".
    pub stream_delivery: String,

    pub open_streams: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_days_bounds() {
        assert!(ttl_from_days(None).unwrap().is_none());
        assert_eq!(
            ttl_from_days(Some(1)).unwrap(),
            Some(Duration::from_secs(86_400))
        );
        assert!(ttl_from_days(Some(30)).is_ok());
        assert!(matches!(ttl_from_days(Some(0)), Err(DsError::BadRequest(_))));
        assert!(matches!(ttl_from_days(Some(31)), Err(DsError::BadRequest(_))));
    }

    #[test]
    fn test_display_name_is_trimmed_and_bounded() {
        assert_eq!(normalize_display_name("  Bob  ").unwrap(), "Bob");
        assert!(normalize_display_name("B").is_err());
        assert!(normalize_display_name("   ").is_err());
        assert!(normalize_display_name(&"x".repeat(100)).is_ok());
        assert!(normalize_display_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_session_id_bounds() {
        assert_eq!(validate_session_id(" sess-1 ").unwrap(), "sess-1");
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"s".repeat(129)).is_err());
    }

    #[test]
    fn test_send_invitations_recipient_bounds() {
        let empty = SendInvitationsRequest {
            recipients: vec![],
            ttl_days: None,
        };
        assert!(empty.validate().is_err());

        let too_many = SendInvitationsRequest {
            recipients: vec!["a@example.com".to_string(); 51],
            ttl_days: None,
        };
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn test_link_request_rejects_zero_uses() {
        let request = CreateLinkRequest {
            ttl_days: Some(1),
            max_uses: Some(0),
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_new_account_debug_redacts_password() {
        let request = NewAccountRequest {
            email: "ada@example.com".to_string(),
            display_name: "Ada".to_string(),
            password: "correct horse".to_string(),
        };
        assert!(!format!("{request:?}").contains("correct horse"));
    }

    #[test]
    fn test_invalid_validity_uses_stable_code() {
        let validity = InvitationValidity::invalid(&DsError::DiscussionFull);
        let json = serde_json::to_value(&validity).unwrap();
        assert_eq!(json["valid"], false);
        assert_eq!(json["reason"], "DISCUSSION_FULL");
        assert!(json.get("discussion").is_none());
    }
}

