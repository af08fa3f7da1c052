//! Middleware for the discussion service.
//!
//! # Components
//!
//! - `session` - optional platform session on API routes
//! - `http_metrics` - HTTP request metrics middleware

pub mod http_metrics;
pub mod session;

pub use http_metrics::http_metrics_middleware;
pub use session::{optional_session, SessionContext};
