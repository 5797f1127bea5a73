use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::poll::{Attempted, PollOutcome, RetryPolicy, Settle, Sleeper};
use crate::store::StoreHandle;

/// Where an entity's current state is read from: a statement key and the column holding the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateProbe {
    pub statement: String,
    pub column: String,
}

impl StateProbe {
    pub fn new(statement: &str, column: &str) -> Self {
        Self {
            statement: statement.to_string(),
            column: column.to_string(),
        }
    }

    /// One read. `None` when the row or the column is missing.
    pub async fn read(&self, store: &dyn StoreHandle, entity_id: &str) -> Result<Option<String>> {
        let row = store
            .query_one(&self.statement, &[entity_id.to_string()])
            .await?;
        Ok(row.and_then(|r| r.get(&self.column).map(str::to_string)))
    }
}

/// Polls a store until an entity reaches a target state.
pub struct TransitionPoller {
    policy: RetryPolicy,
    probe: StateProbe,
    sleeper: Arc<dyn Sleeper>,
}

impl TransitionPoller {
    pub fn new(policy: RetryPolicy, probe: StateProbe, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            policy,
            probe,
            sleeper,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Current state of the entity. Retries only while the store is unreachable.
    pub async fn observe(
        &self,
        store: &dyn StoreHandle,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        read_retrying(
            &self.policy,
            self.sleeper.as_ref(),
            cancel,
            store.name(),
            entity_id,
            || self.probe.read(store, entity_id),
        )
        .await
    }

    /// Poll until `target` is observed, a terminal state shows up, or the budget runs out.
    ///
    /// The returned outcome is the one that ended the loop. Only cancellation and
    /// configuration problems surface as errors here.
    pub async fn confirm(
        &self,
        entity_id: &str,
        target: &str,
        terminal: &HashSet<String>,
        store: &dyn StoreHandle,
        cancel: &CancellationToken,
    ) -> Result<Attempted<PollOutcome>> {
        tracing::info!(
            entity_id,
            target,
            store = store.name(),
            max_attempts = self.policy.max_attempts,
            "Waiting for state change"
        );

        let attempted = self
            .policy
            .run(self.sleeper.as_ref(), cancel, |attempt| async move {
                match self.probe.read(store, entity_id).await {
                    Ok(observed) => {
                        let outcome = classify(observed, target, terminal);
                        tracing::debug!(
                            entity_id,
                            attempt,
                            observed = outcome.observed().unwrap_or("-"),
                            settled = outcome.is_settled(),
                            "Polled state"
                        );
                        Ok(outcome)
                    }
                    Err(e) => absorb_read_error(store.name(), entity_id, attempt, e),
                }
            })
            .await
            .map_err(|interrupted| AppError::Cancelled {
                entity_id: entity_id.to_string(),
                attempts: interrupted.attempts,
            })?;

        attempted.transpose()
    }
}

fn classify(observed: Option<String>, target: &str, terminal: &HashSet<String>) -> PollOutcome {
    match observed {
        Some(state) if state == target => PollOutcome::Confirmed(state),
        Some(state) if terminal.contains(&state) => PollOutcome::TerminalDetected(state),
        observed => PollOutcome::StillPending { observed },
    }
}

/// An unreachable store costs this attempt. Every other read error ends the loop.
pub(crate) fn absorb_read_error<T>(
    store: &str,
    entity_id: &str,
    attempt: u32,
    error: AppError,
) -> Result<PollOutcome<T>> {
    if !error.is_unreachable() {
        return Err(error);
    }
    tracing::warn!(store, entity_id, attempt, error = %error, "Store unreachable");
    Ok(PollOutcome::StoreUnavailable)
}

/// A single logical read that rides out an unreachable store.
///
/// The first successful read wins. Running out of attempts while the store is down
/// is `StoreUnavailable`; any other error is returned at once.
pub async fn read_retrying<T, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    store: &str,
    entity_id: &str,
    mut read: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempted = policy
        .run(sleeper, cancel, |attempt| {
            let pending = read();
            async move {
                match pending.await {
                    Ok(value) => Ok(PollOutcome::Confirmed(value)),
                    Err(e) => absorb_read_error(store, entity_id, attempt, e),
                }
            }
        })
        .await
        .map_err(|interrupted| AppError::Cancelled {
            entity_id: entity_id.to_string(),
            attempts: interrupted.attempts,
        })?
        .transpose()?;

    require_confirmed(attempted, entity_id, "a readable store", store)
}

/// Turn the outcome that ended a poll into the confirmed value or a typed failure.
pub fn require_confirmed<T>(
    attempted: Attempted<PollOutcome<T>>,
    entity_id: &str,
    target: &str,
    store: &str,
) -> Result<T> {
    let attempts = attempted.attempts;
    match attempted.outcome {
        PollOutcome::Confirmed(value) => Ok(value),
        PollOutcome::TerminalDetected(state) => Err(AppError::TerminalState {
            entity_id: entity_id.to_string(),
            state,
            attempts,
        }),
        PollOutcome::StillPending { observed } => Err(AppError::ConfirmationTimeout {
            entity_id: entity_id.to_string(),
            target: target.to_string(),
            last_observed: observed,
            attempts,
        }),
        PollOutcome::StoreUnavailable => Err(AppError::StoreUnavailable {
            store: store.to_string(),
            entity_id: entity_id.to_string(),
            attempts,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Row;
    use crate::testing::{InstantSleeper, Scripted, ScriptedStore};
    use std::time::Duration;

    const STATUS: &str = "user_data_review_status";

    fn poller(max_attempts: u32) -> TransitionPoller {
        TransitionPoller::new(
            RetryPolicy::new(max_attempts, Duration::from_millis(5000)),
            StateProbe::new("review_status", STATUS),
            Arc::new(InstantSleeper::new()),
        )
    }

    fn status(value: &str) -> Scripted {
        Scripted::row(Row::new().with(STATUS, value))
    }

    fn terminal() -> HashSet<String> {
        ["REJECTED", "TEST_IGNORE"].iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_confirms_on_second_attempt() {
        let store = ScriptedStore::new("lending");
        store.script(
            "review_status",
            vec![status("DOCS_UPLOADED"), status("PENDING_REVIEW")],
        );

        let attempted = poller(12)
            .confirm("app-1", "PENDING_REVIEW", &terminal(), &store, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempted.attempts, 2);
        assert_eq!(
            attempted.outcome,
            PollOutcome::Confirmed("PENDING_REVIEW".to_string())
        );
        assert_eq!(store.query_params("review_status")[0], vec!["app-1".to_string()]);
    }

    #[tokio::test]
    async fn test_terminal_stops_polling_immediately() {
        let store = ScriptedStore::new("lending");
        store.script(
            "review_status",
            vec![
                status("DOCS_UPLOADED"),
                status("PENDING_REVIEW"),
                status("REJECTED"),
            ],
        );

        let attempted = poller(12)
            .confirm("app-1", "FRAUD_REVIEW", &terminal(), &store, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempted.attempts, 3);
        assert_eq!(store.query_count("review_status"), 3);

        let err = require_confirmed(attempted, "app-1", "FRAUD_REVIEW", "lending").unwrap_err();
        match err {
            AppError::TerminalState { state, attempts, .. } => {
                assert_eq!(state, "REJECTED");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected terminal state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_reports_last_observed_state() {
        let store = ScriptedStore::new("lending");
        store.script("review_status", vec![status("PENDING_REVIEW")]);

        let attempted = poller(4)
            .confirm("app-1", "FRAUD_REVIEW", &terminal(), &store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.query_count("review_status"), 4);

        match require_confirmed(attempted, "app-1", "FRAUD_REVIEW", "lending").unwrap_err() {
            AppError::ConfirmationTimeout {
                last_observed,
                attempts,
                ..
            } => {
                assert_eq!(last_observed.as_deref(), Some("PENDING_REVIEW"));
                assert_eq!(attempts, 4);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_is_absorbed_until_budget_ends() {
        let store = ScriptedStore::new("lending");
        store.script(
            "review_status",
            vec![Scripted::Unavailable, Scripted::Missing, status("FRAUD_REVIEW")],
        );

        let attempted = poller(5)
            .confirm("app-1", "FRAUD_REVIEW", &terminal(), &store, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(attempted.attempts, 3);

        let down = ScriptedStore::new("lending");
        down.script("review_status", vec![Scripted::Unavailable]);
        let attempted = poller(3)
            .confirm("app-1", "FRAUD_REVIEW", &terminal(), &down, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            require_confirmed(attempted, "app-1", "FRAUD_REVIEW", "lending"),
            Err(AppError::StoreUnavailable { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_poll_is_error() {
        let store = ScriptedStore::new("lending");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = poller(12)
            .confirm("app-1", "FRAUD_REVIEW", &terminal(), &store, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled { attempts: 0, .. }));
        assert_eq!(store.query_count("review_status"), 0);
    }

    #[tokio::test]
    async fn test_statement_error_ends_poll_on_first_attempt() {
        let store = ScriptedStore::new("lending");
        store.script(
            "review_status",
            vec![Scripted::Broken("Unknown column 'user_data_review_status'".to_string())],
        );

        let err = poller(20)
            .confirm("app-1", "FRAUD_REVIEW", &terminal(), &store, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(ref reason) if reason.contains("Unknown column")));
        assert_eq!(store.query_count("review_status"), 1);
    }

    #[test]
    fn test_only_unreachable_errors_are_absorbed() {
        let absorbed = absorb_read_error::<String>(
            "lending",
            "app-1",
            1,
            AppError::from(sqlx::Error::PoolTimedOut),
        );
        assert_eq!(absorbed.unwrap(), PollOutcome::StoreUnavailable);

        let fatal = absorb_read_error::<String>(
            "lending",
            "app-1",
            1,
            AppError::from(sqlx::Error::ColumnNotFound("status".to_string())),
        );
        assert!(matches!(fatal, Err(AppError::Store(_))));
        assert!(absorb_read_error::<String>(
            "lending",
            "app-1",
            1,
            AppError::Config("no statement".to_string())
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_observe_reads_once() {
        let store = ScriptedStore::new("lending");
        store.script("review_status", vec![status("DOCS_UPLOADED")]);

        let state = poller(12)
            .observe(&store, "app-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.as_deref(), Some("DOCS_UPLOADED"));
        assert_eq!(store.query_count("review_status"), 1);
    }

    #[tokio::test]
    async fn test_observe_retries_unreachable_store() {
        let store = ScriptedStore::new("lending");
        store.script(
            "review_status",
            vec![Scripted::Unavailable, status("PENDING_REVIEW")],
        );

        let state = poller(3)
            .observe(&store, "app-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.as_deref(), Some("PENDING_REVIEW"));
        assert_eq!(store.query_count("review_status"), 2);

        let down = ScriptedStore::new("lending");
        down.script("review_status", vec![Scripted::Unavailable]);
        let err = poller(3)
            .observe(&down, "app-1", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AppError::StoreUnavailable {
                store,
                entity_id,
                attempts,
            } => {
                assert_eq!(store, "lending");
                assert_eq!(entity_id, "app-1");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected store unavailable, got {other:?}"),
        }
    }
}
