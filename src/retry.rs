//! Retry and backoff policy.
//!
//! One pure function decides the delay before a failed task or chunk is
//! re-admitted. The same schedule applies whether the retried unit is a whole
//! task or a single chunk's sub-task; only the caller differs.

use std::time::Duration;

/// Exponent cap: delays top out at 2^9 = 512 seconds.
const MAX_SHIFT: u32 = 8;

/// 1-based attempt number derived from the retry budget. The first failure of
/// a task with `retries_remaining == retries_total - 1` (already decremented)
/// is attempt 1.
pub fn attempt_number(retries_total: u32, retries_remaining: u32) -> u32 {
    retries_total.saturating_sub(retries_remaining).max(1)
}

/// Backoff before re-admitting attempt `n` (1-based): `min(2^(n+1), 512)`
/// seconds, i.e. 4s, 8s, 16s, ... capped at 512s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(MAX_SHIFT);
    Duration::from_secs(1u64 << (shift + 1))
}

/// Delay for a unit whose budget was just decremented.
pub fn delay_after_failure(retries_total: u32, retries_remaining: u32) -> Duration {
    backoff_delay(attempt_number(retries_total, retries_remaining))
}
