//! Discussions repository (PostgreSQL).
//!
//! Discussions are created by the lesson layer; this service only reads them,
//! counts their seats and records closure.

use super::{retry_read, DiscussionRepository, PgStore};
use crate::errors::DsError;
use crate::models::Discussion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::DiscussionId;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
pub(super) struct DiscussionRow {
    id: Uuid,
    title: String,
    owner_id: Uuid,
    is_active: bool,
    closed_at: Option<DateTime<Utc>>,
    max_participants: Option<i32>,
    current_invitation_token: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<DiscussionRow> for Discussion {
    fn from(row: DiscussionRow) -> Self {
        Self {
            id: row.id.into(),
            title: row.title,
            owner_id: row.owner_id.into(),
            is_active: row.is_active,
            closed_at: row.closed_at,
            max_participants: row.max_participants,
            current_invitation_token: row.current_invitation_token,
            created_at: row.created_at,
        }
    }
}

pub(super) const DISCUSSION_COLUMNS: &str = "id, title, owner_id, is_active, closed_at, \
     max_participants, current_invitation_token, created_at";

/// Seats held in a discussion. Shared with the seat reservation transaction.
pub(super) const ACTIVE_SEAT_COUNT_SQL: &str = r#"
    SELECT
        (SELECT COUNT(*) FROM discussion_participants
          WHERE discussion_id = $1 AND status = 'active')
      + (SELECT COUNT(*) FROM participants
          WHERE discussion_id = $1 AND left_at IS NULL)
"#;

#[async_trait]
impl DiscussionRepository for PgStore {
    async fn ping(&self) -> Result<(), DsError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(discussion_id = %discussion.id))]
    async fn insert_discussion(
        &self,
        discussion: &Discussion,
        owner_display_name: &str,
    ) -> Result<(), DsError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO discussions
                (id, title, owner_id, is_active, closed_at, max_participants,
                 current_invitation_token, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(discussion.id.as_uuid())
        .bind(&discussion.title)
        .bind(discussion.owner_id.as_uuid())
        .bind(discussion.is_active)
        .bind(discussion.closed_at)
        .bind(discussion.max_participants)
        .bind(&discussion.current_invitation_token)
        .bind(discussion.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO discussion_participants
                (discussion_id, account_id, display_name, role, status, joined_at)
            VALUES ($1, $2, $3, 'owner', 'active', $4)
            "#,
        )
        .bind(discussion.id.as_uuid())
        .bind(discussion.owner_id.as_uuid())
        .bind(owner_display_name)
        .bind(discussion.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(discussion_id = %id))]
    async fn get_discussion(&self, id: DiscussionId) -> Result<Option<Discussion>, DsError> {
        let pool = &self.pool;
        retry_read("get_discussion", move || async move {
            let row: Option<DiscussionRow> = sqlx::query_as(&format!(
                "SELECT {DISCUSSION_COLUMNS} FROM discussions WHERE id = $1"
            ))
            .bind(id.as_uuid())
            .fetch_optional(pool)
            .await?;
            Ok(row.map(Discussion::from))
        })
        .await
    }

    #[instrument(skip_all, fields(discussion_id = %id))]
    async fn close_discussion(&self, id: DiscussionId, at: DateTime<Utc>) -> Result<bool, DsError> {
        let result = sqlx::query(
            r#"
            UPDATE discussions
            SET closed_at = $2, is_active = FALSE
            WHERE id = $1 AND closed_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(discussion_id = %id))]
    async fn active_seat_count(&self, id: DiscussionId) -> Result<i64, DsError> {
        let pool = &self.pool;
        retry_read("active_seat_count", move || async move {
            let count: i64 = sqlx::query_scalar(ACTIVE_SEAT_COUNT_SQL)
                .bind(id.as_uuid())
                .fetch_one(pool)
                .await?;
            Ok(count)
        })
        .await
    }
}
