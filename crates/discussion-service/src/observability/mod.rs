//! Observability for the discussion service.
//!
//! Metric definitions and the Prometheus recorder. The HTTP metrics
//! middleware that feeds them lives in [`crate::middleware`].

pub mod metrics;
