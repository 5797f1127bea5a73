use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::actuator::http::HttpActuator;
use crate::actuator::{ActuationOutcome, Actuator};
use crate::config::WorkflowConfig;
use crate::error::{AppError, Result};
use crate::poll::{require_confirmed, RetryPolicy, Sleeper, StateProbe, TransitionPoller};
use crate::store::{StoreHandle, StoreRegistry};
use crate::workflow::stages::StageSequence;
use crate::workflow::types::{RunReport, StepReport, TransitionRequest};

/// Moves one entity through the stage sequence, one confirmed step at a time.
pub struct WorkflowDriver {
    stages: StageSequence,
    actuator: Arc<dyn Actuator>,
    poller: TransitionPoller,
    store: Arc<dyn StoreHandle>,
    sleeper: Arc<dyn Sleeper>,
    actuation_retry: RetryPolicy,
    default_target: Option<String>,
}

impl WorkflowDriver {
    pub fn new(
        stages: StageSequence,
        actuator: Arc<dyn Actuator>,
        poller: TransitionPoller,
        store: Arc<dyn StoreHandle>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            stages,
            actuator,
            poller,
            store,
            sleeper,
            actuation_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            default_target: None,
        }
    }

    pub fn with_actuation_retry(mut self, policy: RetryPolicy) -> Self {
        self.actuation_retry = policy;
        self
    }

    pub fn with_default_target(mut self, target: Option<String>) -> Self {
        self.default_target = target;
        self
    }

    pub fn from_config(
        config: &WorkflowConfig,
        stores: &StoreRegistry,
        client: reqwest::Client,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        let stages = StageSequence::new(
            config.stages.clone(),
            config.terminal_states.iter().cloned(),
        )?;
        if let Some(target) = &config.target {
            if stages.position(target).is_none() {
                return Err(AppError::Config(format!(
                    "Workflow target {target} is not a stage"
                )));
            }
        }

        let poller = TransitionPoller::new(
            RetryPolicy::from(&config.poll),
            StateProbe::new(&config.status_statement, &config.status_column),
            Arc::clone(&sleeper),
        );
        let actuator = Arc::new(HttpActuator::new(
            "workflow",
            client,
            config.actuator.clone(),
        ));

        Ok(Self::new(stages, actuator, poller, stores.get(&config.store)?, sleeper)
            .with_actuation_retry(RetryPolicy::from(&config.actuation_retry))
            .with_default_target(config.target.clone()))
    }

    pub fn stages(&self) -> &StageSequence {
        &self.stages
    }

    /// Configured target, or the last stage.
    pub fn default_target(&self) -> &str {
        self.default_target
            .as_deref()
            .unwrap_or_else(|| self.stages.last())
    }

    /// Drive `entity_id` from `start` to `target`.
    pub async fn run(
        &self,
        entity_id: &str,
        start: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        if start == target {
            tracing::info!(entity_id, state = start, "Already at target, nothing to do");
            return Ok(RunReport {
                entity_id: entity_id.to_string(),
                final_state: start.to_string(),
                steps: Vec::new(),
            });
        }

        if self.stages.is_terminal(start) {
            tracing::warn!(entity_id, state = start, "Run starts in a terminal state");
            return Err(AppError::TerminalState {
                entity_id: entity_id.to_string(),
                state: start.to_string(),
                attempts: 0,
            });
        }

        self.check_route(start, target)?;

        tracing::info!(entity_id, start, target, store = self.store.name(), "Starting workflow run");

        let mut current = start.to_string();
        let mut steps = Vec::new();

        while current != target {
            let next = self.stages.advance(&current)?.to_string();
            let request = TransitionRequest::new(entity_id, &current, &next, self.store.name());

            let actuation_attempts = self.actuate(&request, cancel).await?;

            let attempted = self
                .poller
                .confirm(
                    entity_id,
                    &next,
                    self.stages.terminal_states(),
                    self.store.as_ref(),
                    cancel,
                )
                .await?;
            let poll_attempts = attempted.attempts;
            require_confirmed(attempted, entity_id, &next, self.store.name())?;

            tracing::info!(
                entity_id,
                from = %current,
                to = %next,
                actuation_attempts,
                poll_attempts,
                "Stage confirmed"
            );

            steps.push(StepReport {
                from: current,
                to: next.clone(),
                actuation_attempts,
                poll_attempts,
            });
            current = next;
        }

        Ok(RunReport {
            entity_id: entity_id.to_string(),
            final_state: current,
            steps,
        })
    }

    /// Read the entity's current stage from the status store, then `run`.
    pub async fn run_from_store(
        &self,
        entity_id: &str,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let target = target.unwrap_or_else(|| self.default_target());
        let current = self
            .poller
            .observe(self.store.as_ref(), entity_id, cancel)
            .await?
            .ok_or_else(|| AppError::Precondition {
                entity_id: entity_id.to_string(),
                step: "read_status".to_string(),
                reason: format!("no review status in store {}", self.store.name()),
            })?;

        tracing::info!(entity_id, observed = %current, "Read current stage");
        self.run(entity_id, &current, target, cancel).await
    }

    fn check_route(&self, start: &str, target: &str) -> Result<()> {
        let from = self
            .stages
            .position(start)
            .ok_or_else(|| AppError::Config(format!("Unknown start state {start}")))?;
        let to = self
            .stages
            .position(target)
            .ok_or_else(|| AppError::Config(format!("Unknown target state {target}")))?;
        if to <= from {
            return Err(AppError::Config(format!(
                "Target {target} does not come after {start}"
            )));
        }
        Ok(())
    }

    /// Returns the number of attempts the actuation took.
    async fn actuate(&self, request: &TransitionRequest, cancel: &CancellationToken) -> Result<u32> {
        let base = request.context();

        let attempted = self
            .actuation_retry
            .run(self.sleeper.as_ref(), cancel, |attempt| {
                let context = base.with_attempt(attempt);
                async move {
                    let outcome = self.actuator.act(&context).await;
                    if let ActuationOutcome::TransientFailure(reason) = &outcome {
                        tracing::warn!(
                            entity_id = %context.entity_id,
                            step = %request.describe(),
                            attempt,
                            reason = %reason,
                            "Transient actuation failure"
                        );
                    }
                    outcome
                }
            })
            .await
            .map_err(|interrupted| AppError::Cancelled {
                entity_id: request.entity_id.clone(),
                attempts: interrupted.attempts,
            })?;

        match attempted.outcome {
            ActuationOutcome::Success => Ok(attempted.attempts),
            ActuationOutcome::TransientFailure(reason) | ActuationOutcome::HardFailure(reason) => {
                Err(AppError::Actuation {
                    entity_id: request.entity_id.clone(),
                    action: request.describe(),
                    attempts: attempted.attempts,
                    reason,
                })
            }
        }
    }
}
