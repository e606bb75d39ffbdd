//! Exponential retry backoff.
//!
//! The delay before retry attempt `n` (zero-based) is
//! `min(base * 2^n, max_delay)`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default base delay for the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Default upper bound on any retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Backoff policy for the retry pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(with = "serde_duration")]
    pub base: Duration,

    /// Cap applied to every computed delay.
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Create a policy with the given base and cap.
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self { base, max_delay }
    }

    /// Delay before the retry that follows `retry_count` previous retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`delay_for`](Self::delay_for) in whole milliseconds.
    pub fn delay_ms_for(&self, retry_count: u32) -> u64 {
        u64::try_from(self.delay_for(retry_count).as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as milliseconds.
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_sequence() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_ms_for(0), 5_000);
        assert_eq!(policy.delay_ms_for(1), 10_000);
        assert_eq!(policy.delay_ms_for(3), 40_000);
        assert_eq!(policy.delay_ms_for(5), 160_000);
        assert_eq!(policy.delay_ms_for(6), 300_000);
    }

    #[test]
    fn test_backoff_respects_max_delay() {
        let policy = BackoffPolicy::default();

        for n in 6..40 {
            assert_eq!(policy.delay_for(n), DEFAULT_MAX_DELAY);
        }
        assert_eq!(policy.delay_for(u32::MAX), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let policy = BackoffPolicy::new(Duration::from_millis(10), Duration::from_secs(1));
        let delays: Vec<_> = (0..12).map(|n| policy.delay_for(n)).collect();

        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_policy_serialization() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(30));
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"base":250,"max_delay":30000}"#);

        let decoded: BackoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, policy);
    }
}
