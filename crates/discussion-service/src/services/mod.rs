//! Service layer for the discussion service.
//!
//! # Components
//!
//! - `broadcaster` - fan-out of discussion events to open streams
//! - `capacity` - atomic admission against a participant ceiling
//! - `invitations` - invitation records, validation and redemption
//! - `messages` - append, page, edit, delete, react, typing
//! - `notifier` - invitation delivery seam
//! - `participation` - join, accept and leave
//! - `rate_limiter` - per-sender message budget

pub mod broadcaster;
pub mod capacity;
pub mod invitations;
pub mod messages;
pub mod notifier;
pub mod participation;
pub mod rate_limiter;

pub use broadcaster::{BroadcasterOptions, RealtimeBroadcaster};
pub use capacity::CapacityGuard;
pub use invitations::InvitationRegistry;
pub use messages::MessageService;
pub use notifier::{InvitationNotifier, LogNotifier};
pub use participation::ParticipationService;
pub use rate_limiter::RateLimiter;
