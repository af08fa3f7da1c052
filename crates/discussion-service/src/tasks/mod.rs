//! Background tasks for the discussion service.
//!
//! # Tasks
//!
//! - `invitation_expiry` - Marks pending invitations past their expiry as expired

pub mod invitation_expiry;

pub use invitation_expiry::start_invitation_sweeper;
