//! Cooperative rate limiting for API collaborators.
//!
//! When the remaining quota hits zero the caller sleeps until the reset time
//! announced by the API, then carries on. Nothing else in the crate sleeps.
//!
//! The mining pipeline itself talks only to git remotes and never calls a
//! hosting API. This is the hook for the client that builds repository
//! lists from such an API: feed it the response headers with
//! [`RateLimit::from_headers`] and call [`RateLimit::wait_if_exhausted`]
//! before the next request.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tracing::info;

/// Quota state as reported by the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimit {
    /// Build from raw header values; `reset` is a Unix timestamp in seconds.
    pub fn from_headers(limit: &str, remaining: &str, reset: &str) -> Option<Self> {
        let limit = limit.trim().parse().ok()?;
        let remaining = remaining.trim().parse().ok()?;
        let reset: i64 = reset.trim().parse().ok()?;
        let reset_at = Utc.timestamp_opt(reset, 0).single()?;
        Some(Self {
            limit,
            remaining,
            reset_at,
        })
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// How long to wait before the next call, one second past the reset.
    pub fn wait_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.is_exhausted() {
            return None;
        }
        let secs = (self.reset_at - now).num_seconds() + 1;
        Some(Duration::from_secs(secs.max(0) as u64))
    }

    /// Sleep until the quota resets if it is exhausted.
    pub fn wait_if_exhausted(&self) {
        self.wait_with(Utc::now(), std::thread::sleep);
    }

    fn wait_with<F: FnOnce(Duration)>(&self, now: DateTime<Utc>, sleep: F) {
        if let Some(wait) = self.wait_duration(now) {
            info!(seconds = wait.as_secs(), "Rate limit exceeded; waiting for reset");
            sleep(wait);
        }
        info!(remaining = self.remaining, limit = self.limit, "Rate limit");
    }
}
