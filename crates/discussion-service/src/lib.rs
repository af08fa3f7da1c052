//! Discussion Service Library
//!
//! The participation core of an AI-facilitated discussion platform:
//!
//! - Invitations (email and shareable link) backed by signed tokens
//! - Admission of members and anonymous participants under a capacity limit
//! - A paginated, threaded message log
//! - Real-time fan-out of discussion events over server-sent events
//!
//! # Architecture
//!
//! Handler -> Service -> Repository:
//!
//! ```text
//! routes/mod.rs -> handlers/*.rs -> services/*.rs -> repositories/*.rs
//! ```
//!
//! # Modules
//!
//! - `auth` - Invitation tokens, sessions, caller resolution
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - Session and HTTP metrics middleware
//! - `models` - Domain types and API bodies
//! - `observability` - Metrics
//! - `repositories` - Persistence (PostgreSQL and in-memory)
//! - `routes` - Axum router and application state
//! - `services` - Invitation registry, admission, messages, broadcaster
//! - `tasks` - Background maintenance

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod tasks;
