//! Exponential backoff with jitter for startup connection attempts.

use std::time::Duration;
use rand::Rng;

/// Delay before connection attempt `attempt` (1-based).
pub fn connect_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }

    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt - 2));
    let capped = delay_ms.min(max_ms);

    // Up to 10% jitter so restarted instances do not reconnect in lockstep.
    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}
