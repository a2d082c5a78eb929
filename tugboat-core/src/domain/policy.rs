//! Retry policy domain type

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Bounded retry policy for a polling loop
///
/// Every wait in the pipeline declares one of these explicitly. There is no
/// way to construct an unbounded policy: `max_attempts` is always at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RetryPolicySpec", into = "RetryPolicySpec")]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
    per_attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Creates a new policy, rejecting `max_attempts == 0`
    pub fn new(
        max_attempts: u32,
        interval: Duration,
        per_attempt_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry policy max_attempts must be greater than 0".to_string(),
            ));
        }
        if per_attempt_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "retry policy per_attempt_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            max_attempts,
            interval,
            per_attempt_timeout,
        })
    }

    /// Derives a policy that spends roughly `timeout` polling every `interval`
    ///
    /// Used where a caller thinks in terms of an overall deadline (such as
    /// waiting for a rollout) rather than an attempt count.
    pub fn from_timeout(timeout: Duration, interval: Duration, per_attempt_timeout: Duration) -> Self {
        let step = (interval + per_attempt_timeout).as_millis().max(1);
        let attempts = (timeout.as_millis() / step).clamp(1, u32::MAX as u128) as u32;

        Self {
            max_attempts: attempts,
            interval,
            per_attempt_timeout: if per_attempt_timeout.is_zero() {
                Duration::from_secs(1)
            } else {
                per_attempt_timeout
            },
        }
    }

    /// Same policy with the per-attempt timeout raised to at least `floor`
    pub fn with_min_attempt_timeout(&self, floor: Duration) -> Self {
        Self {
            per_attempt_timeout: self.per_attempt_timeout.max(floor),
            ..*self
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout
    }

    /// Upper bound on wall-clock time spent under this policy
    pub fn total_budget(&self) -> Duration {
        (self.interval + self.per_attempt_timeout) * self.max_attempts
    }
}

/// Serialized form of a [`RetryPolicy`], with durations in whole seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicySpec {
    pub max_attempts: u32,
    pub interval_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl TryFrom<RetryPolicySpec> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(spec: RetryPolicySpec) -> Result<Self, Self::Error> {
        RetryPolicy::new(
            spec.max_attempts,
            Duration::from_secs(spec.interval_secs),
            Duration::from_secs(spec.attempt_timeout_secs),
        )
    }
}

impl From<RetryPolicy> for RetryPolicySpec {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            interval_secs: policy.interval.as_secs(),
            attempt_timeout_secs: policy.per_attempt_timeout.as_secs(),
        }
    }
}
