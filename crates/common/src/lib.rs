//! Common utilities and types shared across Agora discussion components.

#![warn(clippy::pedantic)]

/// Module for strongly typed identifiers
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, clock skew, unverified decoding)
pub mod jwt;
