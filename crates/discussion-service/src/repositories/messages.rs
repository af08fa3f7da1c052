//! Messages repository (PostgreSQL).
//!
//! Append order is the `seq` BIGSERIAL column; pagination walks it downward
//! so pages never overlap and new appends never shift issued cursors.

use super::{parse_column, retry_read, MessageRepository, PgStore};
use crate::errors::DsError;
use crate::models::{Message, NewMessage, ParentFilter, ReactionCount};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{DiscussionId, MessageId};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    seq: i64,
    discussion_id: Uuid,
    author_account_id: Option<Uuid>,
    author_participant_id: Option<Uuid>,
    sender_name: String,
    sender_kind: String,
    content: String,
    parent_id: Option<Uuid>,
    is_edited: bool,
    edited_at: Option<DateTime<Utc>>,
    is_deleted: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = DsError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            seq: row.seq,
            discussion_id: row.discussion_id.into(),
            author_account_id: row.author_account_id.map(Into::into),
            author_participant_id: row.author_participant_id.map(Into::into),
            sender_name: row.sender_name,
            sender_kind: parse_column(&row.sender_kind)?,
            content: row.content,
            parent_id: row.parent_id.map(Into::into),
            is_edited: row.is_edited,
            edited_at: row.edited_at,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, seq, discussion_id, author_account_id, author_participant_id, \
     sender_name, sender_kind, content, parent_id, is_edited, edited_at, is_deleted, created_at";

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, DsError> {
    rows.into_iter().map(Message::try_from).collect()
}

#[async_trait]
impl MessageRepository for PgStore {
    #[instrument(skip_all, fields(discussion_id = %message.discussion_id, message_id = %message.id))]
    async fn insert_message(&self, message: &NewMessage) -> Result<Message, DsError> {
        let row: MessageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO messages
                (id, discussion_id, author_account_id, author_participant_id,
                 sender_name, sender_kind, content, parent_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(message.id.as_uuid())
        .bind(message.discussion_id.as_uuid())
        .bind(message.sender.account_id().map(|id| id.as_uuid()))
        .bind(message.sender.participant_id().map(|id| id.as_uuid()))
        .bind(message.sender.display_name())
        .bind(message.sender.kind().as_str())
        .bind(&message.content)
        .bind(message.parent_id.map(|id| id.as_uuid()))
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, DsError> {
        let pool = &self.pool;
        retry_read("find_message", move || async move {
            let row: Option<MessageRow> = sqlx::query_as(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
            ))
            .bind(id.as_uuid())
            .fetch_optional(pool)
            .await?;
            row.map(Message::try_from).transpose()
        })
        .await
    }

    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    async fn page_messages(
        &self,
        discussion_id: DiscussionId,
        filter: ParentFilter,
        before_seq: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>, DsError> {
        let pool = &self.pool;
        // $3: 0 = any, 1 = top level only, 2 = replies to $4
        let (mode, parent): (i32, Option<Uuid>) = match filter {
            ParentFilter::Any => (0, None),
            ParentFilter::TopLevel => (1, None),
            ParentFilter::RepliesTo(id) => (2, Some(id.as_uuid())),
        };

        retry_read("page_messages", move || async move {
            let rows: Vec<MessageRow> = sqlx::query_as(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS} FROM messages
                WHERE discussion_id = $1
                  AND ($2::bigint IS NULL OR seq < $2)
                  AND ($3 = 0
                       OR ($3 = 1 AND parent_id IS NULL)
                       OR ($3 = 2 AND parent_id = $4))
                ORDER BY seq DESC
                LIMIT $5
                "#
            ))
            .bind(discussion_id.as_uuid())
            .bind(before_seq)
            .bind(mode)
            .bind(parent)
            .bind(limit)
            .fetch_all(pool)
            .await?;
            into_messages(rows)
        })
        .await
    }

    #[instrument(skip_all, fields(discussion_id = %discussion_id, after_seq))]
    async fn messages_after(
        &self,
        discussion_id: DiscussionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<Message>, DsError> {
        let pool = &self.pool;
        retry_read("messages_after", move || async move {
            let rows: Vec<MessageRow> = sqlx::query_as(&format!(
                r#"
                SELECT {MESSAGE_COLUMNS} FROM messages
                WHERE discussion_id = $1 AND seq > $2
                ORDER BY seq ASC
                LIMIT $3
                "#
            ))
            .bind(discussion_id.as_uuid())
            .bind(after_seq)
            .bind(limit)
            .fetch_all(pool)
            .await?;
            into_messages(rows)
        })
        .await
    }

    async fn latest_seq(&self, discussion_id: DiscussionId) -> Result<i64, DsError> {
        let pool = &self.pool;
        retry_read("latest_seq", move || async move {
            let seq: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE discussion_id = $1",
            )
            .bind(discussion_id.as_uuid())
            .fetch_one(pool)
            .await?;
            Ok(seq)
        })
        .await
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, DsError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            r#"
            UPDATE messages
            SET content = $2, is_edited = TRUE, edited_at = $3
            WHERE id = $1 AND is_deleted = FALSE
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(content)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Message::try_from).transpose()
    }

    #[instrument(skip_all, fields(message_id = %id))]
    async fn mark_message_deleted(
        &self,
        id: MessageId,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, DsError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            r#"
            UPDATE messages
            SET is_deleted = TRUE, deleted_at = COALESCE(deleted_at, $2)
            WHERE id = $1
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Message::try_from).transpose()
    }

    #[instrument(skip_all, fields(message_id = %message_id))]
    async fn toggle_reaction(
        &self,
        message_id: MessageId,
        reactor_key: &str,
        symbol: &str,
    ) -> Result<Vec<ReactionCount>, DsError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            r#"
            DELETE FROM message_reactions
            WHERE message_id = $1 AND reactor_key = $2 AND symbol = $3
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(reactor_key)
        .bind(symbol)
        .execute(&mut *tx)
        .await?;

        if removed.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO message_reactions (message_id, reactor_key, symbol)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(message_id.as_uuid())
            .bind(reactor_key)
            .bind(symbol)
            .execute(&mut *tx)
            .await?;
        }

        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT symbol, COUNT(*) FROM message_reactions
            WHERE message_id = $1
            GROUP BY symbol
            ORDER BY MIN(created_at), symbol
            "#,
        )
        .bind(message_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(counts
            .into_iter()
            .map(|(symbol, count)| ReactionCount { symbol, count })
            .collect())
    }

    async fn reaction_counts(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<ReactionCount>>, DsError> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<Uuid> = message_ids.iter().map(MessageId::as_uuid).collect();
        let ids = &ids;
        let pool = &self.pool;

        retry_read("reaction_counts", move || async move {
            let rows: Vec<(Uuid, String, i64)> = sqlx::query_as(
                r#"
                SELECT message_id, symbol, COUNT(*) FROM message_reactions
                WHERE message_id = ANY($1)
                GROUP BY message_id, symbol
                ORDER BY message_id, MIN(created_at), symbol
                "#,
            )
            .bind(ids)
            .fetch_all(pool)
            .await?;

            let mut counts: HashMap<MessageId, Vec<ReactionCount>> = HashMap::new();
            for (message_id, symbol, count) in rows {
                counts
                    .entry(message_id.into())
                    .or_default()
                    .push(ReactionCount { symbol, count });
            }
            Ok(counts)
        })
        .await
    }
}
