//! Wall-clock helpers for lease expiry.
//!
//! Lease deadlines are persisted as unix milliseconds so that they survive a
//! restart of the embedded store. Every lease operation samples the clock
//! once through [`now_ms`] and passes the value down, which keeps the storage
//! layer free of hidden clock reads and easy to test.

use std::time::Duration;

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Unix millisecond deadline `ttl` after `now_ms`.
pub fn deadline_after(now_ms: i64, ttl: Duration) -> i64 {
    now_ms.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}
