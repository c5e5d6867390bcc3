//! Retry predicate and backoff computation
//!
//! Wait before retry `n` is `max(base^n seconds, server hint)`. The server
//! hint comes from the quota header pair when the quota is exhausted, else
//! from `Retry-After`, else zero.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

pub const QUOTA_REMAINING_HEADER: &str = "x-ms-user-quota-remaining";
pub const QUOTA_RESETS_AFTER_HEADER: &str = "x-ms-user-quota-resets-after";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_seconds: u64,
    /// Upper bound of the random multiplier applied to quota reset waits
    pub max_jitter: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 9,
            base_seconds: 2,
            max_jitter: 5,
        }
    }
}

impl RetryPolicy {
    /// Only throttling and gateway timeouts are retried
    pub fn is_retryable(status: u16) -> bool {
        status == 429 || status == 504
    }

    pub fn exponential(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.base_seconds.saturating_pow(attempt))
    }

    /// Wait requested by the server. `jitter` is the multiplier (1..=max_jitter)
    /// applied to quota resets so throttled callers do not retry in lockstep.
    pub fn server_hint(
        &self,
        headers: &HashMap<String, String>,
        now: DateTime<Utc>,
        jitter: u32,
    ) -> Duration {
        let remaining = headers
            .get(QUOTA_REMAINING_HEADER)
            .and_then(|v| v.trim().parse::<i64>().ok());
        let resets_after = headers
            .get(QUOTA_RESETS_AFTER_HEADER)
            .and_then(|v| parse_timespan(v));

        if let (Some(remaining), Some(reset)) = (remaining, resets_after) {
            if remaining <= 0 {
                if let Some(wait) = reset.checked_mul(jitter.clamp(1, self.max_jitter.max(1))) {
                    return wait;
                }
            }
        }

        headers
            .get(RETRY_AFTER_HEADER)
            .and_then(|v| parse_retry_after(v, now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn delay(
        &self,
        attempt: u32,
        headers: &HashMap<String, String>,
        now: DateTime<Utc>,
        jitter: u32,
    ) -> Duration {
        self.exponential(attempt)
            .max(self.server_hint(headers, now, jitter))
    }
}

/// `hh:mm:ss[.fff]`
fn parse_timespan(value: &str) -> Option<Duration> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    let seconds = Duration::try_from_secs_f64(parts[2].parse().ok()?).ok()?;
    let whole = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
    Duration::from_secs(whole).checked_add(seconds)
}

/// Delta seconds or an HTTP date
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some(
        (at.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
