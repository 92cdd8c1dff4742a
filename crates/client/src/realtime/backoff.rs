// Reconnect delay schedule.
//
// delay(attempt) = min(base * 2^(attempt - 1), cap), attempt counted from 1.
// The scheduler bumps the attempt counter before computing a delay and
// refuses once the budget is spent.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Reconnection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries indefinitely.
    pub max_attempts: Option<u32>,
    /// Upper bound of the random delay added to every retry.
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: None,
            jitter: Duration::ZERO,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        // Any negative budget is treated like -1.
        let max_attempts = u32::try_from(config.max_attempts).ok();
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts,
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Attempt counter plus policy.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl BackoffScheduler {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Record a failed attempt and return the delay before the next one,
    /// or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.is_exhausted(self.attempt) {
            return None;
        }
        Some(self.policy.delay_for(self.attempt) + self.jitter())
    }

    fn jitter(&self) -> Duration {
        let max = self.policy.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_sequence_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (1..=6).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000]);
        assert_eq!(policy.delay_for(40), Duration::from_millis(30_000));
    }

    #[test]
    fn scheduler_increments_before_computing() {
        let mut scheduler = BackoffScheduler::new(ReconnectPolicy::default());
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(1_000)));
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(2_000)));
        assert_eq!(scheduler.attempt(), 2);

        scheduler.reset();
        assert_eq!(scheduler.attempt(), 0);
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn scheduler_stops_at_budget() {
        let policy = ReconnectPolicy { max_attempts: Some(3), ..ReconnectPolicy::default() };
        let mut scheduler = BackoffScheduler::new(policy);
        assert!(scheduler.next_delay().is_some());
        assert!(scheduler.next_delay().is_some());
        assert_eq!(scheduler.next_delay(), None);
        assert_eq!(scheduler.next_delay(), None);
    }

    #[test]
    fn unlimited_budget_never_exhausts() {
        let mut scheduler = BackoffScheduler::new(ReconnectPolicy::default());
        for _ in 0..1_000 {
            assert!(scheduler.next_delay().is_some());
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = ReconnectPolicy { jitter: Duration::from_millis(100), ..ReconnectPolicy::default() };
        let mut scheduler = BackoffScheduler::new(policy);
        let delay = scheduler.next_delay().unwrap();
        assert!(delay >= Duration::from_millis(1_000));
        assert!(delay <= Duration::from_millis(1_100));
    }

    #[test]
    fn policy_from_config_maps_negative_budget_to_unlimited() {
        let mut config = ReconnectConfig::default();
        assert_eq!(ReconnectPolicy::from(&config).max_attempts, None);
        config.max_attempts = 3;
        config.jitter_ms = 100;
        let policy = ReconnectPolicy::from(&config);
        assert_eq!(policy.max_attempts, Some(3));
        assert_eq!(policy.jitter, Duration::from_millis(100));
    }
}
