use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::PollConfig;
use crate::poll::Settle;

/// Suspends the current run between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded-attempt, fixed-interval retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

/// Attempt counter for a single loop. Never shared between loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    pub max_attempts: u32,
    pub interval_millis: u64,
    /// Total time spent waiting between attempts, in milliseconds.
    pub elapsed: u64,
    attempts: u32,
}

impl RetryBudget {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    fn record_wait(&mut self) {
        self.elapsed += self.interval_millis;
    }
}

/// The outcome that ended a retry loop, with the attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<O> {
    pub outcome: O,
    pub attempts: u32,
    pub waited: Duration,
}

impl<O, E> Attempted<std::result::Result<O, E>> {
    /// Lift an error that ended the loop out of the attempt record.
    pub fn transpose(self) -> std::result::Result<Attempted<O>, E> {
        let Attempted {
            outcome,
            attempts,
            waited,
        } = self;
        outcome.map(|outcome| Attempted {
            outcome,
            attempts,
            waited,
        })
    }
}

/// The loop stopped because its cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted {
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Worst-case time spent waiting if every attempt comes back unsettled.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }

    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            max_attempts: self.max_attempts,
            interval_millis: self.interval.as_millis() as u64,
            elapsed: 0,
            attempts: 0,
        }
    }

    /// Invoke `check` until it settles or the budget runs out.
    ///
    /// `check` receives the 1-based attempt number. The last unsettled outcome is
    /// returned when the budget is exhausted. Cancellation is observed before each
    /// attempt and while waiting; an attempt already running is allowed to finish.
    pub async fn run<O, F, Fut>(
        &self,
        sleeper: &dyn Sleeper,
        cancel: &CancellationToken,
        mut check: F,
    ) -> std::result::Result<Attempted<O>, Interrupted>
    where
        O: Settle,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = O>,
    {
        let mut budget = self.budget();

        loop {
            if cancel.is_cancelled() {
                return Err(Interrupted {
                    attempts: budget.attempts(),
                });
            }

            let attempt = budget.begin_attempt();
            let outcome = check(attempt).await;

            if outcome.is_settled() || budget.exhausted() {
                return Ok(Attempted {
                    outcome,
                    attempts: attempt,
                    waited: Duration::from_millis(budget.elapsed),
                });
            }

            tracing::debug!(
                attempt,
                max_attempts = self.max_attempts,
                interval_ms = budget.interval_millis,
                "Not settled yet, waiting"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Interrupted { attempts: attempt });
                }
                _ = sleeper.sleep(self.interval) => {
                    budget.record_wait();
                }
            }
        }
    }
}

impl From<&PollConfig> for RetryPolicy {
    fn from(config: &PollConfig) -> Self {
        RetryPolicy::new(config.max_attempts, Duration::from_millis(config.interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollOutcome;
    use crate::testing::InstantSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(5000))
    }

    #[tokio::test]
    async fn test_always_pending_uses_exact_budget() {
        let sleeper = InstantSleeper::new();
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = policy(12)
            .run(&sleeper, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { PollOutcome::<String>::pending() }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 12);
        assert_eq!(result.attempts, 12);
        assert_eq!(result.outcome, PollOutcome::pending());
        // No wait after the final attempt.
        assert_eq!(sleeper.waits().len(), 11);
        assert_eq!(result.waited, Duration::from_millis(55_000));
    }

    #[tokio::test]
    async fn test_stops_on_confirmation() {
        let sleeper = InstantSleeper::new();
        let cancel = CancellationToken::new();

        let result = policy(12)
            .run(&sleeper, &cancel, |attempt| async move {
                if attempt == 3 {
                    PollOutcome::Confirmed("FRAUD_REVIEW".to_string())
                } else {
                    PollOutcome::pending()
                }
            })
            .await
            .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(result.outcome, PollOutcome::Confirmed("FRAUD_REVIEW".to_string()));
        assert_eq!(sleeper.waits(), vec![Duration::from_millis(5000); 2]);
    }

    #[tokio::test]
    async fn test_terminal_short_circuits() {
        let sleeper = InstantSleeper::new();
        let cancel = CancellationToken::new();

        let result = policy(12)
            .run(&sleeper, &cancel, |attempt| async move {
                if attempt == 2 {
                    PollOutcome::<String>::TerminalDetected("REJECTED".to_string())
                } else {
                    PollOutcome::pending()
                }
            })
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert!(matches!(result.outcome, PollOutcome::TerminalDetected(_)));
    }

    #[tokio::test]
    async fn test_store_unavailable_consumes_attempts() {
        let sleeper = InstantSleeper::new();
        let cancel = CancellationToken::new();

        let result = policy(4)
            .run(&sleeper, &cancel, |attempt| async move {
                match attempt {
                    1 | 2 => PollOutcome::StoreUnavailable,
                    _ => PollOutcome::Confirmed("ADDED".to_string()),
                }
            })
            .await
            .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(result.outcome, PollOutcome::Confirmed("ADDED".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let sleeper = InstantSleeper::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result = policy(5)
            .run(&sleeper, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { PollOutcome::<String>::pending() }
            })
            .await;

        assert_eq!(result, Err(Interrupted { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_takes_effect_at_next_boundary() {
        let sleeper = InstantSleeper::new();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = policy(10)
            .run(&sleeper, &cancel, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt == 2 {
                    // Operator abort arrives while the second query is in flight.
                    cancel.cancel();
                }
                async { PollOutcome::<String>::pending() }
            })
            .await;

        assert_eq!(result, Err(Interrupted { attempts: 2 }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let p = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.max_wait(), Duration::ZERO);
        assert_eq!(policy(12).max_wait(), Duration::from_secs(55));
    }

    #[test]
    fn test_policy_from_config() {
        let p = RetryPolicy::from(&PollConfig {
            max_attempts: 20,
            interval_ms: 15_000,
        });
        assert_eq!(p.max_attempts, 20);
        assert_eq!(p.interval, Duration::from_secs(15));
        let budget = p.budget();
        assert_eq!(budget.interval_millis, 15_000);
        assert!(!budget.exhausted());
    }
}
