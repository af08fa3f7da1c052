//! Participants repository (PostgreSQL).
//!
//! Covers both anonymous `participants` rows and authenticated
//! `discussion_participants` memberships.
//!
//! # Concurrency
//!
//! `reserve_seat` locks the discussion row with `SELECT ... FOR UPDATE`, so
//! every admission for one discussion is serialized: the seat count read and
//! the insert that grows it happen under the same lock. Two joins racing for
//! the last seat cannot both observe room.

use super::accounts::insert_account;
use super::discussions::ACTIVE_SEAT_COUNT_SQL;
use super::{parse_column, retry_read, PgStore, ParticipantRepository};
use crate::errors::DsError;
use crate::models::{
    Admission, DiscussionParticipant, InvitationKind, MemberRole, MembershipStatus, Participant,
    ParticipantKind, Redemption, RosterEntry, Seat, SeatRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{AccountId, DiscussionId, ParticipantId};
use sqlx::PgConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct ParticipantRow {
    id: Uuid,
    discussion_id: Uuid,
    display_name: String,
    session_id: String,
    joined_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
}

impl From<ParticipantRow> for Participant {
    fn from(row: ParticipantRow) -> Self {
        Self {
            id: row.id.into(),
            discussion_id: row.discussion_id.into(),
            display_name: row.display_name,
            session_id: row.session_id,
            joined_at: row.joined_at,
            left_at: row.left_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    discussion_id: Uuid,
    account_id: Uuid,
    display_name: String,
    role: String,
    status: String,
    message_count: i64,
    last_seen_at: Option<DateTime<Utc>>,
    joined_at: DateTime<Utc>,
}

impl TryFrom<MembershipRow> for DiscussionParticipant {
    type Error = DsError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(Self {
            discussion_id: row.discussion_id.into(),
            account_id: row.account_id.into(),
            display_name: row.display_name,
            role: parse_column(&row.role)?,
            status: parse_column(&row.status)?,
            message_count: row.message_count,
            last_seen_at: row.last_seen_at,
            joined_at: row.joined_at,
        })
    }
}

const PARTICIPANT_COLUMNS: &str = "id, discussion_id, display_name, session_id, joined_at, left_at";

const MEMBERSHIP_COLUMNS: &str = "discussion_id, account_id, display_name, role, status, \
     message_count, last_seen_at, joined_at";

/// Fail with `DiscussionFull` unless one more seat fits. Caller holds the
/// discussion row lock.
async fn ensure_room(
    conn: &mut PgConnection,
    discussion_id: DiscussionId,
    max_participants: Option<i32>,
) -> Result<(), DsError> {
    let Some(max) = max_participants else {
        return Ok(());
    };

    let active: i64 = sqlx::query_scalar(ACTIVE_SEAT_COUNT_SQL)
        .bind(discussion_id.as_uuid())
        .fetch_one(&mut *conn)
        .await?;

    if active >= i64::from(max) {
        debug!(
            target: "ds.repositories.participants",
            discussion_id = %discussion_id,
            active,
            max,
            "Seat rejected: discussion full"
        );
        return Err(DsError::DiscussionFull);
    }
    Ok(())
}

async fn reserve_anonymous(
    conn: &mut PgConnection,
    discussion_id: DiscussionId,
    max_participants: Option<i32>,
    display_name: &str,
    session_id: &str,
) -> Result<Admission, DsError> {
    let existing: Option<ParticipantRow> = sqlx::query_as(&format!(
        r#"
        SELECT {PARTICIPANT_COLUMNS} FROM participants
        WHERE discussion_id = $1 AND session_id = $2 AND left_at IS NULL
        "#
    ))
    .bind(discussion_id.as_uuid())
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(row) = existing {
        // Same session resubmitting: keep the seat, maybe rename it
        let mut participant = Participant::from(row);
        let renamed_from = if participant.display_name == display_name {
            None
        } else {
            sqlx::query("UPDATE participants SET display_name = $2 WHERE id = $1")
                .bind(participant.id.as_uuid())
                .bind(display_name)
                .execute(&mut *conn)
                .await?;
            Some(std::mem::replace(
                &mut participant.display_name,
                display_name.to_string(),
            ))
        };

        return Ok(Admission {
            seat: Seat::Anonymous(participant),
            newly_admitted: false,
            renamed_from,
        });
    }

    ensure_room(conn, discussion_id, max_participants).await?;

    let row: ParticipantRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO participants (id, discussion_id, display_name, session_id)
        VALUES ($1, $2, $3, $4)
        RETURNING {PARTICIPANT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(discussion_id.as_uuid())
    .bind(display_name)
    .bind(session_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Admission {
        seat: Seat::Anonymous(row.into()),
        newly_admitted: true,
        renamed_from: None,
    })
}

/// Returns the admission and whether it created a membership row.
async fn reserve_member(
    conn: &mut PgConnection,
    discussion_id: DiscussionId,
    max_participants: Option<i32>,
    account_id: AccountId,
    display_name: &str,
    role: MemberRole,
) -> Result<(Admission, bool), DsError> {
    let existing: Option<MembershipRow> = sqlx::query_as(&format!(
        r#"
        SELECT {MEMBERSHIP_COLUMNS} FROM discussion_participants
        WHERE discussion_id = $1 AND account_id = $2
        "#
    ))
    .bind(discussion_id.as_uuid())
    .bind(account_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await?;

    let existing = existing.map(DiscussionParticipant::try_from).transpose()?;

    let created = existing.is_none();
    let row: MembershipRow = match existing {
        Some(membership) if membership.is_active() => {
            return Ok((
                Admission {
                    seat: Seat::Member(membership),
                    newly_admitted: false,
                    renamed_from: None,
                },
                false,
            ));
        }
        Some(membership) if membership.status == MembershipStatus::Removed => {
            return Err(DsError::Forbidden(
                "You have been removed from this discussion".to_string(),
            ));
        }
        Some(_) => {
            // LEFT membership comes back; the role is kept
            ensure_room(conn, discussion_id, max_participants).await?;
            sqlx::query_as(&format!(
                r#"
                UPDATE discussion_participants
                SET status = 'active', display_name = $3, last_seen_at = NOW()
                WHERE discussion_id = $1 AND account_id = $2
                RETURNING {MEMBERSHIP_COLUMNS}
                "#
            ))
            .bind(discussion_id.as_uuid())
            .bind(account_id.as_uuid())
            .bind(display_name)
            .fetch_one(&mut *conn)
            .await?
        }
        None => {
            ensure_room(conn, discussion_id, max_participants).await?;
            sqlx::query_as(&format!(
                r#"
                INSERT INTO discussion_participants
                    (discussion_id, account_id, display_name, role, status, last_seen_at)
                VALUES ($1, $2, $3, $4, 'active', NOW())
                RETURNING {MEMBERSHIP_COLUMNS}
                "#
            ))
            .bind(discussion_id.as_uuid())
            .bind(account_id.as_uuid())
            .bind(display_name)
            .bind(role.as_str())
            .fetch_one(&mut *conn)
            .await?
        }
    };

    Ok((
        Admission {
            seat: Seat::Member(row.try_into()?),
            newly_admitted: true,
            renamed_from: None,
        },
        created,
    ))
}

/// `created_seat` is true when the admission wrote a row that did not exist
/// before, as opposed to reusing or reactivating one.
async fn apply_redemption(
    conn: &mut PgConnection,
    redemption: Redemption,
    newly_admitted: bool,
    created_seat: bool,
) -> Result<(), DsError> {
    match redemption.kind {
        InvitationKind::Link if newly_admitted => {
            let result = sqlx::query(
                r#"
                UPDATE invitations
                SET use_count = use_count + 1
                WHERE id = $1
                  AND status = 'pending'
                  AND (max_uses IS NULL OR use_count < max_uses)
                "#,
            )
            .bind(redemption.invitation_id.as_uuid())
            .execute(&mut *conn)
            .await?;

            if result.rows_affected() == 0 {
                return Err(DsError::InvitationExhausted);
            }
        }
        InvitationKind::Link => {}
        InvitationKind::Email => {
            let result = sqlx::query(
                r#"
                UPDATE invitations
                SET status = 'accepted', responded_at = NOW()
                WHERE id = $1 AND status = 'pending'
                "#,
            )
            .bind(redemption.invitation_id.as_uuid())
            .execute(&mut *conn)
            .await?;

            // Once accepted, an email invitation only lets existing seats back in
            if created_seat && result.rows_affected() == 0 {
                debug!(
                    target: "ds.repositories.participants",
                    invitation_id = %redemption.invitation_id,
                    "Seat rejected: email invitation already used"
                );
                return Err(DsError::InvitationRevokedOrCancelled);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ParticipantRepository for PgStore {
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    async fn reserve_seat(
        &self,
        discussion_id: DiscussionId,
        request: &SeatRequest,
        redemption: Option<Redemption>,
    ) -> Result<Admission, DsError> {
        let mut tx = self.pool.begin().await?;

        let discussion: Option<(bool, Option<DateTime<Utc>>, Option<i32>)> = sqlx::query_as(
            r#"
            SELECT is_active, closed_at, max_participants
            FROM discussions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(discussion_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((is_active, closed_at, max_participants)) = discussion else {
            return Err(DsError::DiscussionNotFound);
        };

        if !is_active || closed_at.is_some() {
            return Err(DsError::DiscussionInactive);
        }

        let (admission, created_seat) = match request {
            SeatRequest::Anonymous {
                display_name,
                session_id,
            } => {
                let admission = reserve_anonymous(
                    &mut *tx,
                    discussion_id,
                    max_participants,
                    display_name,
                    session_id,
                )
                .await?;
                let created = admission.newly_admitted;
                (admission, created)
            }
            SeatRequest::Member {
                account_id,
                display_name,
                role,
            } => {
                reserve_member(
                    &mut *tx,
                    discussion_id,
                    max_participants,
                    *account_id,
                    display_name,
                    *role,
                )
                .await?
            }
            SeatRequest::Registration { account } => {
                // Rolled back with the seat if admission fails
                insert_account(&mut *tx, account).await?;
                reserve_member(
                    &mut *tx,
                    discussion_id,
                    max_participants,
                    account.id,
                    &account.display_name,
                    MemberRole::Member,
                )
                .await?
            }
        };

        if let Some(redemption) = redemption {
            apply_redemption(&mut *tx, redemption, admission.newly_admitted, created_seat).await?;
        }

        tx.commit().await?;
        Ok(admission)
    }

    #[instrument(skip_all, fields(participant_id = %id))]
    async fn find_participant(&self, id: ParticipantId) -> Result<Option<Participant>, DsError> {
        let pool = &self.pool;
        retry_read("find_participant", move || async move {
            let row: Option<ParticipantRow> = sqlx::query_as(&format!(
                "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE id = $1"
            ))
            .bind(id.as_uuid())
            .fetch_optional(pool)
            .await?;
            Ok(row.map(Participant::from))
        })
        .await
    }

    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    async fn find_membership(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
    ) -> Result<Option<DiscussionParticipant>, DsError> {
        let pool = &self.pool;
        retry_read("find_membership", move || async move {
            let row: Option<MembershipRow> = sqlx::query_as(&format!(
                r#"
                SELECT {MEMBERSHIP_COLUMNS} FROM discussion_participants
                WHERE discussion_id = $1 AND account_id = $2
                "#
            ))
            .bind(discussion_id.as_uuid())
            .bind(account_id.as_uuid())
            .fetch_optional(pool)
            .await?;
            row.map(DiscussionParticipant::try_from).transpose()
        })
        .await
    }

    #[instrument(skip_all, fields(participant_id = %id))]
    async fn leave_participant(
        &self,
        id: ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<bool, DsError> {
        let result = sqlx::query(
            "UPDATE participants SET left_at = $2 WHERE id = $1 AND left_at IS NULL",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    async fn leave_membership(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
    ) -> Result<bool, DsError> {
        let result = sqlx::query(
            r#"
            UPDATE discussion_participants
            SET status = 'left'
            WHERE discussion_id = $1 AND account_id = $2 AND status = 'active'
            "#,
        )
        .bind(discussion_id.as_uuid())
        .bind(account_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    async fn roster(&self, discussion_id: DiscussionId) -> Result<Vec<RosterEntry>, DsError> {
        let pool = &self.pool;
        retry_read("roster", move || async move {
            let rows: Vec<(Uuid, String, String, Option<String>, DateTime<Utc>)> =
                sqlx::query_as(
                    r#"
                    SELECT account_id, 'account', display_name, role, joined_at
                    FROM discussion_participants
                    WHERE discussion_id = $1 AND status = 'active'
                    UNION ALL
                    SELECT id, 'anonymous', display_name, NULL::text, joined_at
                    FROM participants
                    WHERE discussion_id = $1 AND left_at IS NULL
                    ORDER BY 5, 1
                    "#,
                )
                .bind(discussion_id.as_uuid())
                .fetch_all(pool)
                .await?;

            rows.into_iter()
                .map(|(id, kind, display_name, role, joined_at)| {
                    Ok::<_, DsError>(RosterEntry {
                        id,
                        kind: if kind == "account" {
                            ParticipantKind::Account
                        } else {
                            ParticipantKind::Anonymous
                        },
                        display_name,
                        role: role.as_deref().map(parse_column::<MemberRole>).transpose()?,
                        joined_at,
                    })
                })
                .collect()
        })
        .await
    }

    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    async fn record_member_activity(
        &self,
        discussion_id: DiscussionId,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<(), DsError> {
        sqlx::query(
            r#"
            UPDATE discussion_participants
            SET message_count = message_count + 1, last_seen_at = $3
            WHERE discussion_id = $1 AND account_id = $2
            "#,
        )
        .bind(discussion_id.as_uuid())
        .bind(account_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
