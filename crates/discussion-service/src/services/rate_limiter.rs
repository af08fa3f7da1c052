//! Fixed-window message rate limiting, per sender per discussion.

use crate::errors::DsError;
use common::types::DiscussionId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    windows: Mutex<HashMap<(DiscussionId, String), Window>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit: limit_per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one send for `sender_key`.
    ///
    /// # Errors
    ///
    /// `RateLimited` once the window's budget is spent.
    pub fn check(&self, discussion_id: DiscussionId, sender_key: &str) -> Result<(), DsError> {
        self.check_at(discussion_id, sender_key, Instant::now())
    }

    /// Give back a send counted by [`check`](Self::check) that was refused.
    pub fn refund(&self, discussion_id: DiscussionId, sender_key: &str) {
        if let Ok(mut windows) = self.windows.lock() {
            if let Some(window) = windows.get_mut(&(discussion_id, sender_key.to_string())) {
                window.count = window.count.saturating_sub(1);
            }
        }
    }

    fn check_at(
        &self,
        discussion_id: DiscussionId,
        sender_key: &str,
        now: Instant,
    ) -> Result<(), DsError> {
        let mut windows = self.windows.lock().map_err(|_| DsError::Internal)?;

        // Drop stale windows so the map tracks only recent senders
        windows.retain(|_, w| now.duration_since(w.started) < WINDOW);

        let window = windows
            .entry((discussion_id, sender_key.to_string()))
            .or_insert(Window {
                started: now,
                count: 0,
            });

        if window.count >= self.limit {
            return Err(DsError::RateLimited);
        }
        window.count += 1;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_applies_per_sender_and_discussion() {
        let limiter = RateLimiter::new(2);
        let discussion = DiscussionId::new();
        let now = Instant::now();

        assert!(limiter.check_at(discussion, "account:a", now).is_ok());
        assert!(limiter.check_at(discussion, "account:a", now).is_ok());
        assert!(matches!(
            limiter.check_at(discussion, "account:a", now),
            Err(DsError::RateLimited)
        ));

        assert!(limiter.check_at(discussion, "account:b", now).is_ok());
        assert!(limiter.check_at(DiscussionId::new(), "account:a", now).is_ok());
    }

    #[test]
    fn test_refund_restores_budget() {
        let limiter = RateLimiter::new(1);
        let discussion = DiscussionId::new();
        let now = Instant::now();

        assert!(limiter.check_at(discussion, "p", now).is_ok());
        limiter.refund(discussion, "p");
        assert!(limiter.check_at(discussion, "p", now).is_ok());
        assert!(limiter.check_at(discussion, "p", now).is_err());

        // Nothing to give back for an unknown sender
        limiter.refund(discussion, "q");
        assert!(limiter.check_at(discussion, "q", now).is_ok());
    }

    #[test]
    fn test_window_resets_after_a_minute() {
        let limiter = RateLimiter::new(1);
        let discussion = DiscussionId::new();
        let start = Instant::now();

        assert!(limiter.check_at(discussion, "p", start).is_ok());
        assert!(limiter.check_at(discussion, "p", start).is_err());
        assert!(limiter
            .check_at(discussion, "p", start + WINDOW + Duration::from_millis(1))
            .is_ok());
    }
}
