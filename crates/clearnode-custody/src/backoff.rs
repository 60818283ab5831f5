use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
///
/// `attempt` counts from zero for the first retry.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
