//! HTTP request handlers for the discussion service.

pub mod extract;
pub mod health;
pub mod invitations;
pub mod messages;
pub mod metrics;
pub mod participation;
pub mod stream;

pub use health::health_check;
pub use metrics::metrics_handler;
