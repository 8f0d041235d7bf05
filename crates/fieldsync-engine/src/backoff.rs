//! Exponential backoff for entity-level sync retries.
//!
//! The Operation Log applies its own per-operation backoff; this module
//! paces the orchestrator's whole-entity retry after a transport error,
//! so a flapping connection does not hammer the server.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Whether to add +/-25% random jitter to each delay
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: false,
        }
    }
}

/// Calculates the delay for a given attempt number using exponential
/// backoff (attempt 1 gets the initial delay).
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    let capped = delay_secs.min(config.max_delay.as_secs_f64());

    let final_secs = if config.jitter {
        let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
        capped * jitter_factor
    } else {
        capped
    };

    Duration::from_secs_f64(final_secs)
}

/// Retry state for one entity.
#[derive(Debug, Clone)]
pub struct BackoffState {
    /// Number of consecutive failed attempts
    pub attempts: u32,
    /// Current backoff delay
    pub current_delay: Duration,
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            current_delay: Duration::ZERO,
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn record_failure(&mut self, config: &BackoffConfig) -> Duration {
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);
        self.current_delay
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = Duration::ZERO;
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_first_attempt() {
        let config = BackoffConfig::default();
        let delay = calculate_backoff(1, &config);
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = BackoffConfig::default();

        // 5s, 10s, 20s, 40s, 60s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(5));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(10));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(20));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(40));
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(60)); // Capped at max
        assert_eq!(calculate_backoff(10, &config), Duration::from_secs(60)); // Still capped
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 3.0,
            jitter: false,
        };

        // 1s, 3s, 9s, 10s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(3));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(9));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = BackoffConfig {
            jitter: true,
            ..Default::default()
        };

        for _ in 0..100 {
            let delay = calculate_backoff(1, &config);
            // 5s +/- 25%
            assert!(delay >= Duration::from_secs_f64(3.75));
            assert!(delay <= Duration::from_secs_f64(6.25));
        }
    }

    #[test]
    fn test_backoff_state_records_and_resets() {
        let config = BackoffConfig::default();
        let mut state = BackoffState::new();

        assert_eq!(state.record_failure(&config), Duration::from_secs(5));
        assert_eq!(state.record_failure(&config), Duration::from_secs(10));
        assert_eq!(state.attempts, 2);

        state.reset();
        assert_eq!(state.attempts, 0);
        assert_eq!(state.current_delay, Duration::ZERO);
    }
}
