//! Reconnect delay schedule.

#[cfg(test)]
#[path = "backoff_test.rs"]
mod backoff_test;

use std::time::Duration;

/// Delay before reconnect `attempt` (1-based): `base * 2^(attempt - 1)`.
///
/// Saturates instead of overflowing for absurd attempt counts.
#[must_use]
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1_u32 << exponent)
}
