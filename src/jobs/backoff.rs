//! Exponential backoff: `next_retry_at = now + base^attempts seconds`.

use chrono::{DateTime, Duration, Utc};

/// Upper bound on a single backoff delay (30 days).
pub const MAX_BACKOFF_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Delay before the retry that follows failure number `attempts`.
///
/// `attempts` is the post-increment count, so the first retry waits `base^1`
/// seconds. Non-finite or non-positive results collapse to zero.
pub fn backoff_delay(attempts: u32, base: f64) -> Duration {
    let secs = base.powi(attempts.min(i32::MAX as u32) as i32);
    let ms = secs * 1000.0;
    if ms.is_nan() || ms <= 0.0 {
        return Duration::zero();
    }
    Duration::milliseconds(ms.min(MAX_BACKOFF_MS as f64).round() as i64)
}

/// Timestamp at which a job that has failed `attempts` times may run again.
pub fn next_retry_time(attempts: u32, base: f64, now: DateTime<Utc>) -> DateTime<Utc> {
    now + backoff_delay(attempts, base)
}

/// Human readable duration: `1d 2h`, `3h 4m`, `5m 6s`, `7s`.
pub fn format_duration(d: Duration) -> String {
    let seconds = d.num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h", days, hours % 24)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{seconds}s")
    }
}
