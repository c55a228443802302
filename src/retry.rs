//! Reconnect backoff policies
//!
//! A policy only answers "how long until the next attempt". Whether the attempt is still
//! allowed under the timeout ceiling is decided by the connection state machine.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::IoTHubError;

/// Largest exponent applied by the exponential policies before the cap takes over
const MAX_BACKOFF_SHIFT: u32 = 31;

/// Largest accepted interval or delay setting, one year
pub const MAX_RETRY_DELAY_SECS: u64 = 365 * 24 * 60 * 60;

/// Strategy used to space out reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicyKind {
    /// The first failure is terminal
    None,
    /// Reconnect on the next pump cycle
    Immediate,
    /// Fixed delay between attempts
    Interval,
    /// `attempt * interval`
    LinearBackoff,
    /// `interval * 2^attempt`, capped at the maximum delay
    ExponentialBackoff,
    /// Exponential backoff perturbed by a bounded random fraction
    ExponentialBackoffWithJitter,
    /// A uniformly random delay within the configured range
    Random,
}

impl fmt::Display for RetryPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryPolicyKind::None => "none",
            RetryPolicyKind::Immediate => "immediate",
            RetryPolicyKind::Interval => "interval",
            RetryPolicyKind::LinearBackoff => "linear_backoff",
            RetryPolicyKind::ExponentialBackoff => "exponential_backoff",
            RetryPolicyKind::ExponentialBackoffWithJitter => "exponential_backoff_with_jitter",
            RetryPolicyKind::Random => "random",
        };
        f.write_str(name)
    }
}

impl FromStr for RetryPolicyKind {
    type Err = IoTHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" => RetryPolicyKind::None,
            "immediate" => RetryPolicyKind::Immediate,
            "interval" => RetryPolicyKind::Interval,
            "linear_backoff" => RetryPolicyKind::LinearBackoff,
            "exponential_backoff" => RetryPolicyKind::ExponentialBackoff,
            "exponential_backoff_with_jitter" => RetryPolicyKind::ExponentialBackoffWithJitter,
            "random" => RetryPolicyKind::Random,
            other => {
                return Err(IoTHubError::invalid_argument(format!(
                    "unknown retry policy '{}'",
                    other
                )))
            }
        })
    }
}

/// The retry policy as set and read through the client API
///
/// `timeout_limit_seconds == 0` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff strategy
    pub kind: RetryPolicyKind,
    /// Ceiling on the total time spent retrying, zero for no ceiling
    pub timeout_limit_seconds: u64,
}

impl RetryPolicy {
    ///
    pub fn new(kind: RetryPolicyKind, timeout_limit_seconds: u64) -> Self {
        Self {
            kind,
            timeout_limit_seconds,
        }
    }

    /// The ceiling as a duration, `None` when retrying forever
    pub fn timeout_limit(&self) -> Option<Duration> {
        match self.timeout_limit_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryPolicyKind::ExponentialBackoffWithJitter, 0)
    }
}

/// Tuning shared by all policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Fixed interval, and the base of the linear and exponential policies
    pub interval_secs: u64,
    /// Cap applied to the exponential policies
    pub max_delay_secs: u64,
    /// Jitter bound as a fraction of the computed delay, in `0.0..=1.0`
    pub jitter_fraction: f64,
    /// Lower bound of the random policy
    pub random_min_secs: u64,
    /// Upper bound of the random policy
    pub random_max_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            max_delay_secs: 60,
            jitter_fraction: 0.25,
            random_min_secs: 1,
            random_max_secs: 60,
        }
    }
}

impl RetryConfig {
    /// Check the tuning values are usable
    pub fn validate(&self) -> crate::Result<()> {
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(IoTHubError::invalid_argument(format!(
                "jitter fraction {} outside 0.0..=1.0",
                self.jitter_fraction
            )));
        }
        for (name, secs) in [
            ("interval", self.interval_secs),
            ("maximum delay", self.max_delay_secs),
            ("random maximum", self.random_max_secs),
        ] {
            if secs > MAX_RETRY_DELAY_SECS {
                return Err(IoTHubError::invalid_argument(format!(
                    "retry {} of {}s exceeds {}s",
                    name, secs, MAX_RETRY_DELAY_SECS
                )));
            }
        }
        if self.random_min_secs > self.random_max_secs {
            return Err(IoTHubError::invalid_argument(format!(
                "random retry range {}..{} is empty",
                self.random_min_secs, self.random_max_secs
            )));
        }
        Ok(())
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Delay before reconnect attempt `attempt` (zero based)
    ///
    /// Returns `None` when the policy never retries.
    pub fn delay_for_attempt<R: Rng + ?Sized>(
        &self,
        kind: RetryPolicyKind,
        attempt: u32,
        rng: &mut R,
    ) -> Option<Duration> {
        let delay = match kind {
            RetryPolicyKind::None => return None,
            RetryPolicyKind::Immediate => Duration::ZERO,
            RetryPolicyKind::Interval => self.interval(),
            RetryPolicyKind::LinearBackoff => self.interval().saturating_mul(attempt),
            RetryPolicyKind::ExponentialBackoff => self.exponential(attempt),
            RetryPolicyKind::ExponentialBackoffWithJitter => {
                let delay = self.exponential(attempt);
                let bound = delay.as_secs_f64() * self.jitter_fraction;
                if bound > 0.0 {
                    let offset = rng.gen_range(-bound..=bound);
                    Duration::try_from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
                        .unwrap_or(delay)
                } else {
                    delay
                }
            }
            RetryPolicyKind::Random => {
                let secs = rng.gen_range(self.random_min_secs..=self.random_max_secs);
                Duration::from_secs(secs)
            }
        };
        Some(delay)
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let multiplier = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
        self.interval()
            .saturating_mul(multiplier)
            .min(self.max_delay())
    }
}
