//! Strongly typed identifiers for discussion components.
//!
//! Each identifier wraps a [`Uuid`] so that a discussion id can never be
//! passed where a participant id is expected. All of them serialize as the
//! bare UUID string.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Borrow the underlying UUID (for database binds).
            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a discussion
    DiscussionId
);

uuid_id!(
    /// Unique identifier for a platform account
    AccountId
);

uuid_id!(
    /// Unique identifier for an anonymous participant row
    ParticipantId
);

uuid_id!(
    /// Unique identifier for a message
    MessageId
);

uuid_id!(
    /// Unique identifier for an invitation record
    InvitationId
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(DiscussionId::new(), DiscussionId::new());
    }

    #[test]
    fn test_serializes_as_bare_uuid() {
        let uuid = Uuid::new_v4();
        let id = ParticipantId(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));

        let back: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_from_str_rejects_garbage() {
        assert!("not-a-uuid".parse::<MessageId>().is_err());
        let uuid = Uuid::new_v4();
        let parsed: MessageId = uuid.to_string().parse().unwrap();
        assert_eq!(parsed.as_uuid(), uuid);
    }
}
