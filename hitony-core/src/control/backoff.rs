//! Reconnect backoff schedule.

use std::time::Duration;

/// Delay before reconnect attempt `attempt` (0-based): doubles from `base`,
/// capped at `max`. With the defaults this is 3, 6, 12, 24, 24, ... seconds.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(10);
    (base * factor).min(max)
}
