//! Append-only message log operations.
//!
//! Sender identity is resolved once at append time and stored on the row.
//! Pages run newest first and are keyed on the store's `seq`, so appends at
//! the head never disturb a cursor already handed out.

use crate::auth::CallerIdentity;
use crate::errors::DsError;
use crate::models::api::{MessagePage, MessageView, ReactionsResponse};
use crate::models::{Message, NewMessage, ParentFilter, Sender};
use crate::observability::metrics;
use crate::repositories::Store;
use crate::services::broadcaster::{EventKind, Presence, RealtimeBroadcaster};
use crate::services::rate_limiter::RateLimiter;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use common::types::{DiscussionId, MessageId};
use std::sync::Arc;
use tracing::instrument;

/// Content bounds, in characters.
pub const MAX_CONTENT_CHARS: usize = 5000;

/// Reaction symbol bounds, in characters.
pub const MAX_REACTION_CHARS: usize = 16;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Trim and bound-check message content.
///
/// # Errors
///
/// `ContentEmpty` for empty or whitespace-only content, `ContentTooLong`
/// beyond [`MAX_CONTENT_CHARS`].
pub fn validate_content(raw: &str) -> Result<String, DsError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DsError::ContentEmpty);
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(DsError::ContentTooLong {
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(trimmed.to_string())
}

pub fn encode_cursor(seq: i64) -> String {
    URL_SAFE_NO_PAD.encode(seq.to_string())
}

/// # Errors
///
/// `BadRequest` for anything [`encode_cursor`] did not produce.
pub fn decode_cursor(cursor: &str) -> Result<i64, DsError> {
    let invalid = || DsError::BadRequest("Invalid cursor".to_string());
    let bytes = URL_SAFE_NO_PAD.decode(cursor).map_err(|_| invalid())?;
    let text = String::from_utf8(bytes).map_err(|_| invalid())?;
    match text.parse::<i64>() {
        Ok(seq) if seq > 0 => Ok(seq),
        _ => Err(invalid()),
    }
}

pub struct MessageService {
    store: Arc<dyn Store>,
    broadcaster: Arc<RealtimeBroadcaster>,
    limiter: RateLimiter,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn Store>,
        broadcaster: Arc<RealtimeBroadcaster>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            store,
            broadcaster,
            limiter,
        }
    }

    /// Discussion a message belongs to. Used to authorize message-scoped
    /// requests against the right discussion.
    pub async fn discussion_of(&self, message_id: MessageId) -> Result<DiscussionId, DsError> {
        Ok(self.existing(message_id).await?.discussion_id)
    }

    /// Append a message from `caller`.
    ///
    /// # Errors
    ///
    /// - `ContentEmpty` / `ContentTooLong`
    /// - `DiscussionNotFound` / `DiscussionInactive`
    /// - `InvalidParentMessage` - parent missing or in another discussion
    /// - `RateLimited`
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn send(
        &self,
        caller: &CallerIdentity,
        discussion_id: DiscussionId,
        content: &str,
        parent_id: Option<MessageId>,
    ) -> Result<MessageView, DsError> {
        let content = validate_content(content)?;
        let sender_key = caller.key();
        self.limiter.check(discussion_id, &sender_key)?;

        let message = match self
            .append(discussion_id, caller.sender(), content, parent_id)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                // Refused sends do not count against the sender
                self.limiter.refund(discussion_id, &sender_key);
                return Err(e);
            }
        };

        if let CallerIdentity::Account { account_id, .. } = caller {
            self.store
                .record_member_activity(discussion_id, *account_id, message.created_at)
                .await?;
        }

        Ok(MessageView::from(&message))
    }

    /// Post a SYSTEM message, e.g. for lifecycle notices.
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn post_system_message(
        &self,
        discussion_id: DiscussionId,
        content: &str,
    ) -> Result<MessageView, DsError> {
        let content = validate_content(content)?;
        let message = self
            .append(discussion_id, Sender::System, content, None)
            .await?;
        Ok(MessageView::from(&message))
    }

    /// Post a message produced by the AI facilitator.
    #[instrument(skip_all, fields(discussion_id = %discussion_id, persona = %persona))]
    pub async fn post_ai_message(
        &self,
        discussion_id: DiscussionId,
        persona: &str,
        content: &str,
        parent_id: Option<MessageId>,
    ) -> Result<MessageView, DsError> {
        let content = validate_content(content)?;
        let sender = Sender::Ai {
            persona: persona.to_string(),
        };
        let message = self
            .append(discussion_id, sender, content, parent_id)
            .await?;
        Ok(MessageView::from(&message))
    }

    async fn append(
        &self,
        discussion_id: DiscussionId,
        sender: Sender,
        content: String,
        parent_id: Option<MessageId>,
    ) -> Result<Message, DsError> {
        let discussion = self
            .store
            .get_discussion(discussion_id)
            .await?
            .ok_or(DsError::DiscussionNotFound)?;
        if !discussion.is_open() {
            return Err(DsError::DiscussionInactive);
        }

        if let Some(parent_id) = parent_id {
            match self.store.find_message(parent_id).await? {
                Some(parent) if parent.discussion_id == discussion_id => {}
                _ => return Err(DsError::InvalidParentMessage),
            }
        }

        let message = self
            .store
            .insert_message(&NewMessage {
                id: MessageId::new(),
                discussion_id,
                sender,
                content,
                parent_id,
            })
            .await?;

        metrics::record_message_sent(message.sender_kind.as_str());
        tracing::debug!(
            target: "ds.services.messages",
            message_id = %message.id,
            sender_kind = %message.sender_kind,
            "Message appended"
        );

        self.broadcaster.publish(
            discussion_id,
            EventKind::MessageReceived(MessageView::from(&message)),
        );
        Ok(message)
    }

    /// One page, newest first.
    ///
    /// `cursor` is the `nextCursor` of the previous page.
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn page(
        &self,
        discussion_id: DiscussionId,
        limit: Option<u32>,
        cursor: Option<&str>,
        filter: ParentFilter,
    ) -> Result<MessagePage, DsError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let before_seq = cursor.map(decode_cursor).transpose()?;

        let mut messages = self
            .store
            .page_messages(discussion_id, filter, before_seq, i64::from(limit) + 1)
            .await?;

        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);
        let next_cursor = if has_more {
            messages.last().map(|m| encode_cursor(m.seq))
        } else {
            None
        };

        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        let mut reactions = self.store.reaction_counts(&ids).await?;

        Ok(MessagePage {
            messages: messages
                .iter()
                .map(|m| MessageView::new(m, reactions.remove(&m.id).unwrap_or_default()))
                .collect(),
            has_more,
            next_cursor,
        })
    }

    /// # Errors
    ///
    /// `Forbidden` unless `caller` wrote the message.
    #[instrument(skip_all, fields(message_id = %message_id))]
    pub async fn edit(
        &self,
        caller: &CallerIdentity,
        discussion_id: DiscussionId,
        message_id: MessageId,
        content: &str,
    ) -> Result<MessageView, DsError> {
        let content = validate_content(content)?;
        let message = self.in_discussion(discussion_id, message_id).await?;
        if !caller.authored(message.author_account_id, message.author_participant_id) {
            return Err(DsError::Forbidden(
                "Only the author can edit a message".to_string(),
            ));
        }

        let updated = self
            .store
            .update_message_content(message_id, &content, Utc::now())
            .await?
            .ok_or(DsError::MessageNotFound)?;

        let view = MessageView::from(&updated);
        self.broadcaster
            .publish(discussion_id, EventKind::MessageEdited(view.clone()));
        Ok(view)
    }

    /// Tombstone a message.
    ///
    /// # Errors
    ///
    /// `Forbidden` unless `caller` wrote the message or moderates.
    #[instrument(skip_all, fields(message_id = %message_id))]
    pub async fn delete(
        &self,
        caller: &CallerIdentity,
        discussion_id: DiscussionId,
        message_id: MessageId,
    ) -> Result<MessageView, DsError> {
        let message = self.in_discussion(discussion_id, message_id).await?;
        let is_author = caller.authored(message.author_account_id, message.author_participant_id);
        if !is_author && !caller.can_moderate() {
            return Err(DsError::Forbidden(
                "Only the author or a moderator can delete a message".to_string(),
            ));
        }

        let deleted = self
            .store
            .mark_message_deleted(message_id, Utc::now())
            .await?
            .ok_or(DsError::MessageNotFound)?;

        self.broadcaster
            .publish(discussion_id, EventKind::MessageDeleted { message_id });
        Ok(MessageView::from(&deleted))
    }

    /// Toggle `caller`'s reaction.
    #[instrument(skip_all, fields(message_id = %message_id))]
    pub async fn react(
        &self,
        caller: &CallerIdentity,
        discussion_id: DiscussionId,
        message_id: MessageId,
        symbol: &str,
    ) -> Result<ReactionsResponse, DsError> {
        let symbol = symbol.trim();
        let len = symbol.chars().count();
        if len == 0 || len > MAX_REACTION_CHARS {
            return Err(DsError::BadRequest(format!(
                "symbol must be 1 to {} characters",
                MAX_REACTION_CHARS
            )));
        }
        self.in_discussion(discussion_id, message_id).await?;

        let reactions = self
            .store
            .toggle_reaction(message_id, &caller.key(), symbol)
            .await?;

        self.broadcaster.publish(
            discussion_id,
            EventKind::ReactionUpdated {
                message_id,
                reactions: reactions.clone(),
            },
        );
        Ok(ReactionsResponse {
            message_id,
            reactions,
        })
    }

    /// Announce typing state. Not persisted.
    pub fn set_typing(&self, caller: &CallerIdentity, discussion_id: DiscussionId, is_typing: bool) {
        let presence = Presence::from(caller);
        let kind = if is_typing {
            EventKind::TypingStarted(presence)
        } else {
            EventKind::TypingStopped(presence)
        };
        self.broadcaster.publish(discussion_id, kind);
    }

    async fn existing(&self, message_id: MessageId) -> Result<Message, DsError> {
        self.store
            .find_message(message_id)
            .await?
            .ok_or(DsError::MessageNotFound)
    }

    /// A live message of `discussion_id`; deleted and foreign ones are not found.
    async fn in_discussion(
        &self,
        discussion_id: DiscussionId,
        message_id: MessageId,
    ) -> Result<Message, DsError> {
        let message = self.existing(message_id).await?;
        if message.discussion_id != discussion_id || message.is_deleted {
            return Err(DsError::MessageNotFound);
        }
        Ok(message)
    }
}
