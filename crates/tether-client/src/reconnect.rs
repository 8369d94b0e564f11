//! Reconnect budget and backoff.

use std::time::Duration;

use tether_core::retry::calculate_backoff_delay_with_random;
use tether_settings::ReconnectSettings;

/// Next step after a connection failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make reconnect attempt number `attempt` (1-based).
    Retry {
        /// Attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// The budget is spent.
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Counts reconnect attempts since the last successful connect.
///
/// Attempt `n` (1-based) waits
/// `min(max_delay, base_delay * 2^(n-1))` scaled by jitter. Once `max_attempts`
/// attempts have been scheduled, the next failure is terminal. A successful
/// connect calls [`reset`](Self::reset).
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    settings: ReconnectSettings,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a fresh policy.
    pub fn new(settings: ReconnectSettings) -> Self {
        Self {
            settings,
            attempts: 0,
        }
    }

    /// Attempts scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Decide the next step using thread-local randomness for jitter.
    pub fn next_decision(&mut self) -> ReconnectDecision {
        self.next_decision_with_random(rand::random::<f64>())
    }

    /// Decide the next step with explicit randomness in `[0, 1]`.
    pub fn next_decision_with_random(&mut self, random: f64) -> ReconnectDecision {
        if self.attempts >= self.settings.max_attempts {
            return ReconnectDecision::Exhausted {
                attempts: self.attempts,
            };
        }
        let delay_ms = calculate_backoff_delay_with_random(
            self.attempts,
            self.settings.base_delay_ms,
            self.settings.max_delay_ms,
            self.settings.jitter_factor,
            random,
        );
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: Duration::from_millis(delay_ms),
        }
    }
}
