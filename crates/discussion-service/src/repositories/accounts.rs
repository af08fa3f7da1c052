//! Accounts repository (PostgreSQL).
//!
//! Only the slice of the account model this service needs: lookup for
//! recipient binding and creation during invitation acceptance.

use super::{retry_read, AccountRepository, PgStore};
use crate::errors::DsError;
use crate::models::Account;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::AccountId;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    display_name: String,
    password_hash: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id.into(),
            email: row.email,
            display_name: row.display_name,
            password_hash: row.password_hash,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl AccountRepository for PgStore {
    #[instrument(skip_all, fields(account_id = %id))]
    async fn find_account(&self, id: AccountId) -> Result<Option<Account>, DsError> {
        let pool = &self.pool;
        retry_read("find_account", move || async move {
            let row: Option<AccountRow> = sqlx::query_as(
                "SELECT id, email, display_name, password_hash, created_at FROM accounts WHERE id = $1",
            )
            .bind(id.as_uuid())
            .fetch_optional(pool)
            .await?;
            Ok(row.map(Account::from))
        })
        .await
    }

    #[instrument(skip_all)]
    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, DsError> {
        let pool = &self.pool;
        retry_read("find_account_by_email", move || async move {
            let row: Option<AccountRow> = sqlx::query_as(
                r#"
                SELECT id, email, display_name, password_hash, created_at
                FROM accounts
                WHERE lower(email) = lower($1)
                "#,
            )
            .bind(email)
            .fetch_optional(pool)
            .await?;
            Ok(row.map(Account::from))
        })
        .await
    }

    #[instrument(skip_all)]
    async fn create_account(
        &self,
        email: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<Account, DsError> {
        let account = Account {
            id: AccountId::new(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            password_hash: Some(password_hash.to_string()),
            created_at: Utc::now(),
        };
        let mut conn = self.pool.acquire().await?;
        insert_account(&mut *conn, &account).await
    }
}

/// Insert `account` on `conn`, which may be inside a seat transaction.
///
/// # Errors
///
/// `Conflict` when the email is already registered.
pub(super) async fn insert_account(
    conn: &mut PgConnection,
    account: &Account,
) -> Result<Account, DsError> {
    let row: AccountRow = sqlx::query_as(
        r#"
        INSERT INTO accounts (id, email, display_name, password_hash, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, email, display_name, password_hash, created_at
        "#,
    )
    .bind(account.id.as_uuid())
    .bind(&account.email)
    .bind(&account.display_name)
    .bind(account.password_hash.as_deref())
    .bind(account.created_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DsError::Conflict("An account with this email already exists".to_string())
        }
        _ => DsError::from(e),
    })?;

    Ok(row.into())
}
