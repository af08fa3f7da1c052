//! Caller resolution for every discussion-scoped operation.
//!
//! Read-only: safe to run on each inbound request.

use crate::auth::session::SessionClaims;
use crate::auth::token_codec::TokenCodec;
use crate::errors::DsError;
use crate::models::{MemberRole, ParticipantKind, Sender};
use crate::repositories::Store;
use common::types::{AccountId, DiscussionId, ParticipantId};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Anonymous credentials presented alongside a request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
    pub participant_id: Option<ParticipantId>,
}

/// Who is calling.
#[derive(Debug, Clone, PartialEq)]
pub enum CallerIdentity {
    Account {
        account_id: AccountId,
        role: MemberRole,
        display_name: String,
    },
    Anonymous {
        participant_id: ParticipantId,
        display_name: String,
    },
}

impl CallerIdentity {
    pub fn kind(&self) -> ParticipantKind {
        match self {
            CallerIdentity::Account { .. } => ParticipantKind::Account,
            CallerIdentity::Anonymous { .. } => ParticipantKind::Anonymous,
        }
    }

    /// Account id or participant id; the same id roster entries use.
    pub fn id(&self) -> Uuid {
        match self {
            CallerIdentity::Account { account_id, .. } => account_id.as_uuid(),
            CallerIdentity::Anonymous { participant_id, .. } => participant_id.as_uuid(),
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            CallerIdentity::Account { display_name, .. }
            | CallerIdentity::Anonymous { display_name, .. } => display_name,
        }
    }

    pub fn can_moderate(&self) -> bool {
        matches!(self, CallerIdentity::Account { role, .. } if role.can_moderate())
    }

    /// Stable key for per-caller bookkeeping (reactions, rate limits).
    pub fn key(&self) -> String {
        match self {
            CallerIdentity::Account { account_id, .. } => format!("account:{account_id}"),
            CallerIdentity::Anonymous { participant_id, .. } => {
                format!("participant:{participant_id}")
            }
        }
    }

    pub fn sender(&self) -> Sender {
        match self {
            CallerIdentity::Account {
                account_id,
                role,
                display_name,
            } => Sender::Account {
                account_id: *account_id,
                display_name: display_name.clone(),
                role: *role,
            },
            CallerIdentity::Anonymous {
                participant_id,
                display_name,
            } => Sender::Anonymous {
                participant_id: *participant_id,
                display_name: display_name.clone(),
            },
        }
    }

    /// Whether this caller wrote a message with the given author columns.
    pub fn authored(
        &self,
        author_account_id: Option<AccountId>,
        author_participant_id: Option<ParticipantId>,
    ) -> bool {
        match self {
            CallerIdentity::Account { account_id, .. } => author_account_id == Some(*account_id),
            CallerIdentity::Anonymous { participant_id, .. } => {
                author_participant_id == Some(*participant_id)
            }
        }
    }
}

pub struct ParticipantAuthenticator {
    store: Arc<dyn Store>,
    codec: Arc<TokenCodec>,
}

impl ParticipantAuthenticator {
    pub fn new(store: Arc<dyn Store>, codec: Arc<TokenCodec>) -> Self {
        Self { store, codec }
    }

    /// Resolve the caller for `discussion_id`.
    ///
    /// 1. A session whose account holds an ACTIVE membership.
    /// 2. A token bound to this discussion plus a participant id whose row
    ///    belongs to this discussion and has not left.
    ///
    /// Anything else fails closed.
    ///
    /// # Errors
    ///
    /// - `AuthenticationRequired` - no usable credentials
    /// - `TokenInvalid` / `TokenExpired` - token failed verification
    /// - `SessionMismatch` - token or participant belongs elsewhere
    #[instrument(skip_all, fields(discussion_id = %discussion_id))]
    pub async fn resolve(
        &self,
        session: Option<&SessionClaims>,
        discussion_id: DiscussionId,
        credentials: &Credentials,
    ) -> Result<CallerIdentity, DsError> {
        if let Some(session) = session {
            let account_id = session.account_id()?;
            if let Some(membership) = self.store.find_membership(discussion_id, account_id).await? {
                if membership.is_active() {
                    return Ok(CallerIdentity::Account {
                        account_id,
                        role: membership.role,
                        display_name: membership.display_name,
                    });
                }
            }
        }

        let (Some(token), Some(participant_id)) =
            (credentials.token.as_deref(), credentials.participant_id)
        else {
            tracing::debug!(target: "ds.auth.authenticator", "No usable credentials");
            return Err(DsError::AuthenticationRequired);
        };

        let claims = self.codec.verify(token)?;
        if claims.discussion_id != discussion_id {
            tracing::debug!(target: "ds.auth.authenticator", "Token bound to another discussion");
            return Err(DsError::SessionMismatch);
        }

        match self.store.find_participant(participant_id).await? {
            Some(participant)
                if participant.discussion_id == discussion_id && participant.is_present() =>
            {
                Ok(CallerIdentity::Anonymous {
                    participant_id,
                    display_name: participant.display_name,
                })
            }
            _ => {
                tracing::debug!(
                    target: "ds.auth.authenticator",
                    participant_id = %participant_id,
                    "Participant missing, left, or in another discussion"
                );
                Err(DsError::SessionMismatch)
            }
        }
    }
}
