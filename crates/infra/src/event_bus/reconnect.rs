//! Reconnect policy for broker connections.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use horizon_events::{BusError, BusHealth};

/// Backoff strategy between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// How hard to try before declaring a bus unhealthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Total connection attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run `connect` until it succeeds or the policy gives up.
///
/// Never fails: exhaustion is reported as [`BusHealth::Unhealthy`].
pub async fn connect_with_retry<F, Fut>(bus: &str, policy: &ReconnectPolicy, mut connect: F) -> BusHealth
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BusError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connect().await {
            Ok(()) => {
                info!(bus, attempt, "bus connected");
                return BusHealth::Connected;
            }
            Err(err) if policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(bus, attempt, delay_ms = delay.as_millis() as u64, error = %err, "bus connection failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(bus, attempt, error = %err, "bus connection failed; giving up");
                return BusHealth::Unhealthy {
                    reason: format!("{err} after {attempt} attempts"),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn fixed_and_linear_strategies() {
        let fixed = ReconnectPolicy::fixed(3, Duration::from_millis(50));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(50));

        let linear = ReconnectPolicy {
            strategy: BackoffStrategy::Linear,
            ..ReconnectPolicy::default()
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[tokio::test]
    async fn gives_up_as_unhealthy_without_panicking() {
        let attempts = AtomicU32::new(0);
        let policy = ReconnectPolicy::fixed(3, Duration::from_millis(1));

        let health = connect_with_retry("durable", &policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BusError::Connection("refused".into())) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(health, BusHealth::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = ReconnectPolicy::fixed(5, Duration::from_millis(1));

        let health = connect_with_retry("ephemeral", &policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(BusError::Connection("refused".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(health, BusHealth::Connected);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
