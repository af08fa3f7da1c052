//! Discussion service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use common::secret::{signing_secret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default invitation TTL floor (1 hour).
pub const DEFAULT_INVITATION_MIN_TTL_SECONDS: u64 = 3600;

/// Default invitation TTL ceiling (7 days).
pub const DEFAULT_INVITATION_MAX_TTL_SECONDS: u64 = 7 * 24 * 3600;

/// Default invitation TTL (1 day).
pub const DEFAULT_INVITATION_TTL_SECONDS: u64 = 24 * 3600;

/// Default SSE keepalive interval.
pub const DEFAULT_STREAM_KEEPALIVE_SECONDS: u64 = 5;

/// Default poll interval when push delivery is unavailable.
pub const DEFAULT_STREAM_POLL_INTERVAL_SECONDS: u64 = 3;

/// Default per-discussion broadcast buffer.
pub const DEFAULT_BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Default messages per sender per discussion per minute.
pub const DEFAULT_MESSAGE_RATE_LIMIT_PER_MINUTE: u32 = 30;

/// Default interval of the invitation expiry sweep.
pub const DEFAULT_INVITATION_SWEEP_INTERVAL_SECONDS: u64 = 300;

/// Default graceful shutdown drain.
pub const DEFAULT_DRAIN_SECONDS: u64 = 30;

/// How the realtime broadcaster delivers events to open streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDelivery {
    /// In-process broadcast channels, events pushed as they are published.
    Push,
    /// Periodic re-query of the message log.
    Poll,
}

impl StreamDelivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamDelivery::Push => "push",
            StreamDelivery::Poll => "poll",
        }
    }
}

impl FromStr for StreamDelivery {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(StreamDelivery::Push),
            "poll" => Ok(StreamDelivery::Poll),
            other => Err(ConfigError::InvalidValue {
                var: "STREAM_DELIVERY",
                reason: format!("expected 'push' or 'poll', got '{}'", other),
            }),
        }
    }
}

/// Discussion service configuration.
///
/// Database URL and signing secrets are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Externally visible base URL, used to build invitation links.
    pub public_base_url: String,

    /// HMAC key for invitation tokens.
    pub invitation_signing_secret: SecretString,

    /// HMAC key for platform session tokens.
    pub session_signing_secret: SecretString,

    /// Shortest invitation TTL accepted at issuance.
    pub invitation_min_ttl_seconds: u64,

    /// Longest invitation TTL accepted at issuance.
    pub invitation_max_ttl_seconds: u64,

    /// TTL used when the caller does not ask for one.
    pub invitation_default_ttl_seconds: u64,

    /// JWT clock skew tolerance in seconds for session `iat` validation.
    pub jwt_clock_skew_seconds: i64,

    /// Broadcaster strategy.
    pub stream_delivery: StreamDelivery,

    /// Keepalive interval for open streams.
    pub stream_keepalive_seconds: u64,

    /// Poll interval used by [`StreamDelivery::Poll`].
    pub stream_poll_interval_seconds: u64,

    /// Buffered events per discussion before slow listeners lag.
    pub broadcast_channel_capacity: usize,

    /// Messages per sender per discussion per minute.
    pub message_rate_limit_per_minute: u32,

    /// Interval of the invitation expiry sweep.
    pub invitation_sweep_interval_seconds: u64,

    /// Graceful shutdown drain period.
    pub drain_seconds: u64,
}

impl Config {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.stream_keepalive_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.stream_poll_interval_seconds)
    }
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("public_base_url", &self.public_base_url)
            .field("invitation_signing_secret", &"[REDACTED]")
            .field("session_signing_secret", &"[REDACTED]")
            .field("invitation_min_ttl_seconds", &self.invitation_min_ttl_seconds)
            .field("invitation_max_ttl_seconds", &self.invitation_max_ttl_seconds)
            .field(
                "invitation_default_ttl_seconds",
                &self.invitation_default_ttl_seconds,
            )
            .field("jwt_clock_skew_seconds", &self.jwt_clock_skew_seconds)
            .field("stream_delivery", &self.stream_delivery)
            .field("stream_keepalive_seconds", &self.stream_keepalive_seconds)
            .field(
                "stream_poll_interval_seconds",
                &self.stream_poll_interval_seconds,
            )
            .field(
                "broadcast_channel_capacity",
                &self.broadcast_channel_capacity,
            )
            .field(
                "message_rate_limit_per_minute",
                &self.message_rate_limit_per_minute,
            )
            .field(
                "invitation_sweep_interval_seconds",
                &self.invitation_sweep_interval_seconds,
            )
            .field("drain_seconds", &self.drain_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidJwtClockSkew(String),

    #[error("Invalid invitation TTL policy: {0}")]
    InvalidTtlPolicy(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = required(vars, "DATABASE_URL")?;

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());

        let public_base_url = vars
            .get("PUBLIC_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://localhost:8080".to_string());

        let invitation_signing_secret = secret(vars, "INVITATION_SIGNING_SECRET")?;
        let session_signing_secret = secret(vars, "SESSION_SIGNING_SECRET")?;

        let invitation_min_ttl_seconds = positive(
            vars,
            "INVITATION_MIN_TTL_SECONDS",
            DEFAULT_INVITATION_MIN_TTL_SECONDS,
        )?;
        let invitation_max_ttl_seconds = positive(
            vars,
            "INVITATION_MAX_TTL_SECONDS",
            DEFAULT_INVITATION_MAX_TTL_SECONDS,
        )?;
        let invitation_default_ttl_seconds = positive(
            vars,
            "INVITATION_DEFAULT_TTL_SECONDS",
            DEFAULT_INVITATION_TTL_SECONDS,
        )?;

        if invitation_min_ttl_seconds > invitation_max_ttl_seconds {
            return Err(ConfigError::InvalidTtlPolicy(format!(
                "INVITATION_MIN_TTL_SECONDS ({}) exceeds INVITATION_MAX_TTL_SECONDS ({})",
                invitation_min_ttl_seconds, invitation_max_ttl_seconds
            )));
        }

        if !(invitation_min_ttl_seconds..=invitation_max_ttl_seconds)
            .contains(&invitation_default_ttl_seconds)
        {
            return Err(ConfigError::InvalidTtlPolicy(format!(
                "INVITATION_DEFAULT_TTL_SECONDS ({}) must lie within [{}, {}]",
                invitation_default_ttl_seconds,
                invitation_min_ttl_seconds,
                invitation_max_ttl_seconds
            )));
        }

        // Parse JWT clock skew tolerance with validation
        let jwt_clock_skew_seconds = if let Some(value_str) = vars.get("JWT_CLOCK_SKEW_SECONDS") {
            let value: i64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must be a valid integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value <= 0 {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must be positive, got {}",
                    value
                )));
            }

            if value > MAX_CLOCK_SKEW.as_secs() as i64 {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW.as_secs(),
                    value
                )));
            }

            value
        } else {
            DEFAULT_CLOCK_SKEW.as_secs() as i64
        };

        let stream_delivery = match vars.get("STREAM_DELIVERY") {
            Some(value) => value.parse()?,
            None => StreamDelivery::Push,
        };

        let stream_keepalive_seconds = positive(
            vars,
            "STREAM_KEEPALIVE_SECONDS",
            DEFAULT_STREAM_KEEPALIVE_SECONDS,
        )?;
        let stream_poll_interval_seconds = positive(
            vars,
            "STREAM_POLL_INTERVAL_SECONDS",
            DEFAULT_STREAM_POLL_INTERVAL_SECONDS,
        )?;
        let broadcast_channel_capacity = positive(
            vars,
            "BROADCAST_CHANNEL_CAPACITY",
            DEFAULT_BROADCAST_CHANNEL_CAPACITY,
        )?;
        let message_rate_limit_per_minute = positive(
            vars,
            "MESSAGE_RATE_LIMIT_PER_MINUTE",
            DEFAULT_MESSAGE_RATE_LIMIT_PER_MINUTE,
        )?;
        let invitation_sweep_interval_seconds = positive(
            vars,
            "INVITATION_SWEEP_INTERVAL_SECONDS",
            DEFAULT_INVITATION_SWEEP_INTERVAL_SECONDS,
        )?;

        // Zero is allowed: skip the drain entirely
        let drain_seconds = match vars.get("DS_DRAIN_SECONDS") {
            Some(value) => value.parse().map_err(|e| ConfigError::InvalidValue {
                var: "DS_DRAIN_SECONDS",
                reason: format!("must be a non-negative integer, got '{}': {}", value, e),
            })?,
            None => DEFAULT_DRAIN_SECONDS,
        };

        Ok(Config {
            database_url,
            bind_address,
            public_base_url,
            invitation_signing_secret,
            session_signing_secret,
            invitation_min_ttl_seconds,
            invitation_max_ttl_seconds,
            invitation_default_ttl_seconds,
            jwt_clock_skew_seconds,
            stream_delivery,
            stream_keepalive_seconds,
            stream_poll_interval_seconds,
            broadcast_channel_capacity,
            message_rate_limit_per_minute,
            invitation_sweep_interval_seconds,
            drain_seconds,
        })
    }
}

fn required(vars: &HashMap<String, String>, var: &str) -> Result<String, ConfigError> {
    vars.get(var)
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnvVar(var.to_string()))
}

fn secret(vars: &HashMap<String, String>, var: &'static str) -> Result<SecretString, ConfigError> {
    let raw = required(vars, var)?;
    signing_secret(&raw).map_err(|e| ConfigError::InvalidValue {
        var,
        reason: e.to_string(),
    })
}

/// Parse an optional strictly positive number, falling back to `default`.
fn positive<T>(
    vars: &HashMap<String, String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: fmt::Display,
{
    let Some(value_str) = vars.get(var) else {
        return Ok(default);
    };

    let value: T = value_str.parse().map_err(|e| ConfigError::InvalidValue {
        var,
        reason: format!("must be a valid positive integer, got '{}': {}", value_str, e),
    })?;

    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            var,
            reason: "must be greater than 0".to_string(),
        });
    }

    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "DATABASE_URL".to_string(),
                "postgresql://localhost/agora_test".to_string(),
            ),
            (
                "INVITATION_SIGNING_SECRET".to_string(),
                "i".repeat(32),
            ),
            ("SESSION_SIGNING_SECRET".to_string(), "s".repeat(48)),
        ])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.public_base_url, "http://localhost:8080");
        assert_eq!(config.invitation_min_ttl_seconds, 3600);
        assert_eq!(config.invitation_max_ttl_seconds, 604_800);
        assert_eq!(config.invitation_default_ttl_seconds, 86_400);
        assert_eq!(config.jwt_clock_skew_seconds, 300);
        assert_eq!(config.stream_delivery, StreamDelivery::Push);
        assert_eq!(config.keepalive_interval(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.broadcast_channel_capacity, 256);
        assert_eq!(config.message_rate_limit_per_minute, 30);
        assert_eq!(config.drain_seconds, 30);
        assert_eq!(config.invitation_signing_secret.expose_secret(), "i".repeat(32));
    }

    #[test]
    fn test_from_vars_missing_database_url() {
        let mut vars = base_vars();
        vars.remove("DATABASE_URL");

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "DATABASE_URL"));
    }

    #[test]
    fn test_from_vars_short_signing_secret_rejected() {
        let mut vars = base_vars();
        vars.insert("SESSION_SIGNING_SECRET".to_string(), "short".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { var: "SESSION_SIGNING_SECRET", .. })
        ));
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert("PUBLIC_BASE_URL".to_string(), "https://agora.example/".to_string());
        vars.insert("STREAM_DELIVERY".to_string(), "POLL".to_string());
        vars.insert("STREAM_KEEPALIVE_SECONDS".to_string(), "15".to_string());
        vars.insert("DS_DRAIN_SECONDS".to_string(), "0".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert_eq!(config.public_base_url, "https://agora.example");
        assert_eq!(config.stream_delivery, StreamDelivery::Poll);
        assert_eq!(config.stream_keepalive_seconds, 15);
        assert_eq!(config.drain_seconds, 0);
    }

    #[test]
    fn test_from_vars_unknown_delivery_rejected() {
        let mut vars = base_vars();
        vars.insert("STREAM_DELIVERY".to_string(), "carrier-pigeon".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { var: "STREAM_DELIVERY", .. })
        ));
    }

    #[test]
    fn test_from_vars_zero_interval_rejected() {
        let mut vars = base_vars();
        vars.insert("STREAM_POLL_INTERVAL_SECONDS".to_string(), "0".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { var: "STREAM_POLL_INTERVAL_SECONDS", .. })
        ));
    }

    #[test]
    fn test_from_vars_default_ttl_outside_policy() {
        let mut vars = base_vars();
        vars.insert("INVITATION_DEFAULT_TTL_SECONDS".to_string(), "60".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidTtlPolicy(_))));
    }

    #[test]
    fn test_from_vars_inverted_ttl_policy() {
        let mut vars = base_vars();
        vars.insert("INVITATION_MIN_TTL_SECONDS".to_string(), "7200".to_string());
        vars.insert("INVITATION_MAX_TTL_SECONDS".to_string(), "3600".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidTtlPolicy(_))));
    }

    #[test]
    fn test_jwt_clock_skew_bounds() {
        let mut vars = base_vars();
        vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), "600".to_string());
        assert_eq!(Config::from_vars(&vars).unwrap().jwt_clock_skew_seconds, 600);

        vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), "601".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidJwtClockSkew(_))
        ));

        vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidJwtClockSkew(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{:?}", config);

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("agora_test"));
        assert!(!debug_output.contains(&"i".repeat(32)));
        assert!(!debug_output.contains(&"s".repeat(48)));
    }
}
