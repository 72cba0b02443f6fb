/// Exponential reconnect schedule for upstream networks.
use std::time::Duration;

/// How often, and how patiently, a lost network is redialled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry. Retry `k` waits `base * 2^k`.
    pub base: Duration,
    /// Retries allowed in a row before the network is given up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Wait before retry `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }
}

/// Consecutive-failure counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next retry, or `None` once the policy is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Forget past failures. Called once upstream sends `001`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Retries handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
