//! Invitations repository (PostgreSQL).
//!
//! # Security
//!
//! - Token values are never logged
//! - Status changes are guarded by `WHERE status = 'pending'` so transitions
//!   stay monotonic under concurrent requests

use super::{parse_column, retry_read, InvitationRepository, PgStore};
use crate::errors::DsError;
use crate::models::{Invitation, InvitationFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{DiscussionId, InvitationId};
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct InvitationRow {
    id: Uuid,
    kind: String,
    discussion_id: Uuid,
    recipient_email: String,
    recipient_account_id: Option<Uuid>,
    sender_id: Uuid,
    status: String,
    token: String,
    expires_at: DateTime<Utc>,
    max_uses: Option<i32>,
    use_count: i32,
    responded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<InvitationRow> for Invitation {
    type Error = DsError;

    fn try_from(row: InvitationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            kind: parse_column(&row.kind)?,
            discussion_id: row.discussion_id.into(),
            recipient_email: row.recipient_email,
            recipient_account_id: row.recipient_account_id.map(Into::into),
            sender_id: row.sender_id.into(),
            status: parse_column(&row.status)?,
            token: row.token,
            expires_at: row.expires_at,
            max_uses: row.max_uses,
            use_count: row.use_count,
            responded_at: row.responded_at,
            created_at: row.created_at,
        })
    }
}

const INVITATION_COLUMNS: &str = "id, kind, discussion_id, recipient_email, \
     recipient_account_id, sender_id, status, token, expires_at, max_uses, use_count, \
     responded_at, created_at";

const INSERT_INVITATION_SQL: &str = r#"
    INSERT INTO invitations
        (id, kind, discussion_id, recipient_email, recipient_account_id, sender_id,
         status, token, expires_at, max_uses, use_count, responded_at, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
"#;

fn bind_invitation<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    invitation: &'q Invitation,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(invitation.id.as_uuid())
        .bind(invitation.kind.as_str())
        .bind(invitation.discussion_id.as_uuid())
        .bind(&invitation.recipient_email)
        .bind(invitation.recipient_account_id.map(|id| id.as_uuid()))
        .bind(invitation.sender_id.as_uuid())
        .bind(invitation.status.as_str())
        .bind(&invitation.token)
        .bind(invitation.expires_at)
        .bind(invitation.max_uses)
        .bind(invitation.use_count)
        .bind(invitation.responded_at)
        .bind(invitation.created_at)
}

fn map_unique_violation(err: sqlx::Error) -> DsError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DsError::Conflict("Invitation token already exists".to_string())
        }
        _ => DsError::from(err),
    }
}

#[async_trait]
impl InvitationRepository for PgStore {
    #[instrument(skip_all, fields(invitation_id = %invitation.id))]
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), DsError> {
        bind_invitation(sqlx::query(INSERT_INVITATION_SQL), invitation)
            .execute(&self.pool)
            .await
            .map_err(map_unique_violation)?;
        Ok(())
    }

    #[instrument(skip_all, fields(invitation_id = %invitation.id, discussion_id = %invitation.discussion_id))]
    async fn rotate_link_invitation(&self, invitation: &Invitation) -> Result<(), DsError> {
        let mut tx = self.pool.begin().await?;

        // Overwriting the stored token is what revokes every earlier link
        let result = sqlx::query(
            r#"
            UPDATE discussions
            SET current_invitation_token = $2
            WHERE id = $1
            "#,
        )
        .bind(invitation.discussion_id.as_uuid())
        .bind(&invitation.token)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DsError::DiscussionNotFound);
        }

        bind_invitation(sqlx::query(INSERT_INVITATION_SQL), invitation)
            .execute(&mut *tx)
            .await
            .map_err(map_unique_violation)?;

        tx.commit().await?;

        info!(
            target: "ds.repositories.invitations",
            discussion_id = %invitation.discussion_id,
            invitation_id = %invitation.id,
            "Rotated discussion link token"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(invitation_id = %id))]
    async fn find_invitation(&self, id: InvitationId) -> Result<Option<Invitation>, DsError> {
        let pool = &self.pool;
        retry_read("find_invitation", move || async move {
            let row: Option<InvitationRow> = sqlx::query_as(&format!(
                "SELECT {INVITATION_COLUMNS} FROM invitations WHERE id = $1"
            ))
            .bind(id.as_uuid())
            .fetch_optional(pool)
            .await?;
            row.map(Invitation::try_from).transpose()
        })
        .await
    }

    #[instrument(skip_all)]
    async fn find_invitation_by_token(&self, token: &str) -> Result<Option<Invitation>, DsError> {
        let pool = &self.pool;
        retry_read("find_invitation_by_token", move || async move {
            let row: Option<InvitationRow> = sqlx::query_as(&format!(
                "SELECT {INVITATION_COLUMNS} FROM invitations WHERE token = $1"
            ))
            .bind(token)
            .fetch_optional(pool)
            .await?;
            row.map(Invitation::try_from).transpose()
        })
        .await
    }

    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    async fn find_pending_email_invitation(
        &self,
        discussion_id: DiscussionId,
        email: &str,
    ) -> Result<Option<Invitation>, DsError> {
        let pool = &self.pool;
        retry_read("find_pending_email_invitation", move || async move {
            let row: Option<InvitationRow> = sqlx::query_as(&format!(
                r#"
                SELECT {INVITATION_COLUMNS} FROM invitations
                WHERE discussion_id = $1
                  AND kind = 'email'
                  AND status = 'pending'
                  AND recipient_email = $2
                ORDER BY created_at DESC
                LIMIT 1
                "#
            ))
            .bind(discussion_id.as_uuid())
            .bind(email)
            .fetch_optional(pool)
            .await?;
            row.map(Invitation::try_from).transpose()
        })
        .await
    }

    #[instrument(skip_all, fields(invitation_id = %id))]
    async fn decline_invitation(
        &self,
        id: InvitationId,
        at: DateTime<Utc>,
    ) -> Result<bool, DsError> {
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET status = 'declined', responded_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(invitation_id = %id))]
    async fn cancel_invitation(&self, id: InvitationId, at: DateTime<Utc>) -> Result<bool, DsError> {
        let mut tx = self.pool.begin().await?;

        let token: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            UPDATE invitations
            SET status = 'cancelled', responded_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING discussion_id, token
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((discussion_id, token)) = token else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE discussions
            SET current_invitation_token = NULL
            WHERE id = $1 AND current_invitation_token = $2
            "#,
        )
        .bind(discussion_id)
        .bind(&token)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip_all, fields(invitation_id = %id))]
    async fn refresh_invitation(
        &self,
        id: InvitationId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DsError> {
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET token = $2, expires_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(token)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_unique_violation)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all)]
    async fn list_invitations(
        &self,
        filter: &InvitationFilter,
    ) -> Result<(Vec<Invitation>, i64), DsError> {
        let pool = &self.pool;
        let sender_id = filter.sender_id.map(|id| id.as_uuid());
        let discussion_id = filter.discussion_id.map(|id| id.as_uuid());
        let status = filter.status.map(|s| s.as_str());
        let (limit, offset) = (filter.limit, filter.offset);

        retry_read("list_invitations", move || async move {
            // NULL parameters disable their filter
            let rows: Vec<InvitationRow> = sqlx::query_as(&format!(
                r#"
                SELECT {INVITATION_COLUMNS} FROM invitations
                WHERE ($1::uuid IS NULL OR sender_id = $1)
                  AND ($2::uuid IS NULL OR discussion_id = $2)
                  AND ($3::text IS NULL OR status = $3)
                ORDER BY created_at DESC, id
                LIMIT $4 OFFSET $5
                "#
            ))
            .bind(sender_id)
            .bind(discussion_id)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?;

            let total: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM invitations
                WHERE ($1::uuid IS NULL OR sender_id = $1)
                  AND ($2::uuid IS NULL OR discussion_id = $2)
                  AND ($3::text IS NULL OR status = $3)
                "#,
            )
            .bind(sender_id)
            .bind(discussion_id)
            .bind(status)
            .fetch_one(pool)
            .await?;

            let invitations = rows
                .into_iter()
                .map(Invitation::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((invitations, total))
        })
        .await
    }

    #[instrument(skip_all)]
    async fn expire_invitations(&self, now: DateTime<Utc>) -> Result<u64, DsError> {
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET status = 'expired'
            WHERE status = 'pending' AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
