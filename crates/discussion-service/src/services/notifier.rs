//! Invitation delivery.
//!
//! Email rendering lives outside this service; the registry hands a
//! [`InvitationDelivery`] to whatever [`InvitationNotifier`] is wired in.

use crate::errors::DsError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{DiscussionId, InvitationId};
use std::fmt;

/// One invitation to deliver.
#[derive(Clone)]
pub struct InvitationDelivery {
    pub invitation_id: InvitationId,
    pub discussion_id: DiscussionId,
    pub discussion_title: String,
    pub recipient_email: String,
    pub sender_name: String,
    /// Carries the token; never logged.
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for InvitationDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvitationDelivery")
            .field("invitation_id", &self.invitation_id)
            .field("discussion_id", &self.discussion_id)
            .field("url", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait InvitationNotifier: Send + Sync {
    async fn deliver(&self, delivery: &InvitationDelivery) -> Result<(), DsError>;
}

/// Default notifier: records the delivery in the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl InvitationNotifier for LogNotifier {
    async fn deliver(&self, delivery: &InvitationDelivery) -> Result<(), DsError> {
        tracing::info!(
            target: "ds.services.notifier",
            invitation_id = %delivery.invitation_id,
            discussion_id = %delivery.discussion_id,
            expires_at = %delivery.expires_at,
            "Invitation ready for delivery"
        );
        Ok(())
    }
}

/// Notifier doubles for tests.
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Keeps every delivery in memory; can be told to fail for addresses.
    #[derive(Default)]
    pub struct RecordingNotifier {
        deliveries: Mutex<Vec<InvitationDelivery>>,
        failing: Mutex<HashSet<String>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make deliveries to `email` fail.
        pub fn fail_for(&self, email: &str) {
            if let Ok(mut failing) = self.failing.lock() {
                failing.insert(email.to_string());
            }
        }

        pub fn deliveries(&self) -> Vec<InvitationDelivery> {
            self.deliveries
                .lock()
                .map(|d| d.clone())
                .unwrap_or_default()
        }

        /// Latest delivery to `email`.
        pub fn last_for(&self, email: &str) -> Option<InvitationDelivery> {
            self.deliveries()
                .into_iter()
                .rev()
                .find(|d| d.recipient_email == email)
        }
    }

    #[async_trait]
    impl InvitationNotifier for RecordingNotifier {
        async fn deliver(&self, delivery: &InvitationDelivery) -> Result<(), DsError> {
            let should_fail = self
                .failing
                .lock()
                .map(|f| f.contains(&delivery.recipient_email))
                .unwrap_or(false);
            if should_fail {
                return Err(DsError::ServiceUnavailable(
                    "Mock delivery failure".to_string(),
                ));
            }
            if let Ok(mut deliveries) = self.deliveries.lock() {
                deliveries.push(delivery.clone());
            }
            Ok(())
        }
    }
}
