//! Bounded polling.
//!
//! Delays are front-loaded: 200 ms after each of the first five attempts,
//! 400 ms after the next five, then 2 s. The attempt count for a budget is
//! the smallest number whose cumulative inter-attempt delay reaches the
//! budget, so a never-succeeding predicate runs for at least the budget and
//! less than the budget plus one delay.

use std::future::Future;
use std::time::Duration;

const SHORT_DELAY_MS: u64 = 200;
const MEDIUM_DELAY_MS: u64 = 400;
const LONG_DELAY_MS: u64 = 2000;

/// Delay slept after attempt `attempt` (1-based) fails.
#[must_use]
pub fn delay_after(attempt: u32) -> Duration {
    let ms = match attempt {
        0..=5 => SHORT_DELAY_MS,
        6..=10 => MEDIUM_DELAY_MS,
        _ => LONG_DELAY_MS,
    };
    Duration::from_millis(ms)
}

/// Number of attempts made within `budget`.
#[must_use]
pub fn max_attempts(budget: Duration) -> u32 {
    let mut waited = Duration::ZERO;
    let mut delays = 0_u32;
    while waited < budget {
        delays += 1;
        waited += delay_after(delays);
    }
    delays + 1
}

/// Invoke `predicate(attempt, max_attempts)` until it returns `true` or the
/// attempts for `budget` are used up. Sleeps between attempts, never after
/// the last one. Returns `false` on exhaustion; the caller decides whether
/// that is fatal.
pub async fn retry<F, Fut>(budget: Duration, mut predicate: F) -> bool
where
    F: FnMut(u32, u32) -> Fut,
    Fut: Future<Output = bool>,
{
    let max = max_attempts(budget);
    for attempt in 1..=max {
        if predicate(attempt, max).await {
            return true;
        }
        if attempt < max {
            let delay = delay_after(attempt);
            tracing::debug!(
                attempt,
                max_attempts = max,
                delay = ?delay,
                "not ready, waiting"
            );
            tokio::time::sleep(delay).await;
        }
    }
    false
}
