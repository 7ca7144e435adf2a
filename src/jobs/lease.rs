//! Lease rules: when a held lease counts as expired.
//!
//! The store's atomic claim compares `locked_at` against `expiry_cutoff` in
//! SQL (see `LibSqlBackend::claim_next`).

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default lease timeout: 5 minutes.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Lease timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    timeout: Duration,
}

impl LeasePolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Leases taken strictly before this instant are expired.
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `now - locked_at > timeout`.
    pub fn is_expired(&self, locked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        locked_at < self.expiry_cutoff(now)
    }
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> LeasePolicy {
        LeasePolicy::new(Duration::from_secs(60))
    }

    #[test]
    fn fresh_lease_is_held() {
        let now = Utc::now();
        assert!(!policy().is_expired(now - chrono::Duration::seconds(10), now));
        assert!(policy().is_expired(now - chrono::Duration::seconds(61), now));
    }

    #[test]
    fn cutoff_is_timeout_before_now() {
        let now = Utc::now();
        assert_eq!(policy().expiry_cutoff(now), now - chrono::Duration::seconds(60));
    }

    #[test]
    fn lease_exactly_at_timeout_is_still_held() {
        let now = Utc::now();
        assert!(!policy().is_expired(now - chrono::Duration::seconds(60), now));
        assert!(policy().is_expired(now - chrono::Duration::milliseconds(60_001), now));
    }

    #[test]
    fn default_timeout_is_five_minutes() {
        assert_eq!(LeasePolicy::default().timeout(), Duration::from_secs(300));
    }

    #[test]
    fn huge_timeout_does_not_overflow() {
        let policy = LeasePolicy::new(Duration::from_secs(u64::MAX / 4));
        assert!(!policy.is_expired(Utc::now(), Utc::now()));
    }

    proptest! {
        #[test]
        fn expiry_matches_elapsed_time(timeout_ms in 1u64..1_000_000, age_ms in 0i64..2_000_000) {
            let now = Utc::now();
            let policy = LeasePolicy::new(Duration::from_millis(timeout_ms));
            let locked_at = now - chrono::Duration::milliseconds(age_ms);
            prop_assert_eq!(policy.is_expired(locked_at, now), age_ms > timeout_ms as i64);
        }
    }
}
