use std::time::Duration;

use tagrelay_config::SupervisorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive crashes at which the supervisor stops trying.
    pub max_restarts: u32,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.restart_base_delay_ms),
            max_delay: Duration::from_millis(config.restart_max_delay_ms),
            max_restarts: config.max_restarts,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { delay: Duration, attempt: u32 },
    GiveUp { crashes: u32 },
}

/// Counts consecutive worker crashes. A `ready` from the worker resets it.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    crashes: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy, crashes: 0 }
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    pub fn on_ready(&mut self) {
        self.crashes = 0;
    }

    pub fn on_crash(&mut self) -> RestartDecision {
        self.crashes = self.crashes.saturating_add(1);
        if self.crashes >= self.policy.max_restarts {
            return RestartDecision::GiveUp { crashes: self.crashes };
        }
        let factor = 2u32.checked_pow(self.crashes - 1).unwrap_or(u32::MAX);
        RestartDecision::Restart {
            delay: self.policy.base_delay.saturating_mul(factor).min(self.policy.max_delay),
            attempt: self.crashes,
        }
    }
}
