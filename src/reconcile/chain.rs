use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::actuator::http::HttpActuator;
use crate::actuator::{ActuationContext, ActuationOutcome, Actuator};
use crate::config::{ChainConfig, PrepareConfig};
use crate::error::{AppError, Result};
use crate::poll::poller::absorb_read_error;
use crate::poll::{read_retrying, require_confirmed, PollOutcome, RetryPolicy, Sleeper};
use crate::reconcile::types::{ChainOutcome, LeadRecord, ReconciliationRecord};
use crate::store::{Row, StoreHandle, StoreRegistry};

const TOUCH_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Work done against a step's store before its precondition check.
#[derive(Debug, Clone)]
pub enum Preparation {
    /// The row must exist and each listed column must hold one of the allowed values.
    Guard {
        statement: String,
        expect: BTreeMap<String, Vec<String>>,
    },
    /// Write `[now + offset, key]`; must affect a row.
    Touch {
        statement: String,
        offset_minutes: i64,
    },
}

impl From<&PrepareConfig> for Preparation {
    fn from(config: &PrepareConfig) -> Self {
        match config {
            PrepareConfig::Guard { statement, expect } => Preparation::Guard {
                statement: statement.clone(),
                expect: expect.clone(),
            },
            PrepareConfig::Touch {
                statement,
                offset_minutes,
            } => Preparation::Touch {
                statement: statement.clone(),
                offset_minutes: *offset_minutes,
            },
        }
    }
}

pub struct Promotion {
    pub column: String,
    pub when: String,
    pub trigger: Arc<dyn Actuator>,
}

/// One trigger -> confirm sub-flow against a single store.
pub struct ChainStep {
    pub name: String,
    pub store: Arc<dyn StoreHandle>,
    pub preparations: Vec<Preparation>,
    pub existing: Option<String>,
    pub trigger: Option<Arc<dyn Actuator>>,
    pub lookup: String,
    pub expect: BTreeMap<String, Vec<String>>,
    pub terminal: BTreeMap<String, Vec<String>>,
    pub promote: Option<Promotion>,
    pub derive_key: Option<String>,
    pub poll: RetryPolicy,
}

impl ChainStep {
    /// Step that only polls `lookup` until `expect` holds.
    pub fn new(
        name: &str,
        store: Arc<dyn StoreHandle>,
        lookup: &str,
        expect: BTreeMap<String, Vec<String>>,
        poll: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            store,
            preparations: Vec::new(),
            existing: None,
            trigger: None,
            lookup: lookup.to_string(),
            expect,
            terminal: BTreeMap::new(),
            promote: None,
            derive_key: None,
            poll,
        }
    }

    fn expectation(&self) -> String {
        self.expect
            .iter()
            .map(|(column, allowed)| format!("{column}={}", allowed.join("|")))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn is_confirmed(&self, row: &Row) -> bool {
        matches_all(row, &self.expect)
    }

    fn terminal_match(&self, row: &Row) -> Option<String> {
        self.terminal.iter().find_map(|(column, values)| {
            row.get(column)
                .filter(|v| values.iter().any(|t| t == *v))
                .map(|v| format!("{column}={v}"))
        })
    }
}

fn matches_all(row: &Row, expect: &BTreeMap<String, Vec<String>>) -> bool {
    expect.iter().all(|(column, allowed)| {
        row.get(column)
            .map_or(false, |value| allowed.iter().any(|a| a == value))
    })
}

/// Sequence of sub-flows linked by a derived correlation key.
///
/// The first step is keyed by the entity id. Each later step is keyed by the
/// `derive_key` column of the previous step's confirmed record, or by the
/// previous key when no column is configured.
pub struct ReconciliationChain {
    name: String,
    steps: Vec<ChainStep>,
    sleeper: Arc<dyn Sleeper>,
    actuation_retry: RetryPolicy,
}

impl ReconciliationChain {
    pub fn new(
        name: &str,
        steps: Vec<ChainStep>,
        sleeper: Arc<dyn Sleeper>,
        actuation_retry: RetryPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            steps,
            sleeper,
            actuation_retry,
        }
    }

    pub fn from_config(
        name: &str,
        config: &ChainConfig,
        stores: &StoreRegistry,
        client: &reqwest::Client,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        let mut steps = Vec::with_capacity(config.steps.len());
        for step in &config.steps {
            let trigger = step.trigger.as_ref().map(|t| {
                Arc::new(HttpActuator::new(
                    &format!("{name}.{}", step.name),
                    client.clone(),
                    t.clone(),
                )) as Arc<dyn Actuator>
            });
            let promote = step.promote.as_ref().map(|p| Promotion {
                column: p.column.clone(),
                when: p.when.clone(),
                trigger: Arc::new(HttpActuator::new(
                    &format!("{name}.{}.promote", step.name),
                    client.clone(),
                    p.trigger.clone(),
                )),
            });

            steps.push(ChainStep {
                name: step.name.clone(),
                store: stores.get(&step.store)?,
                preparations: step.prepare.iter().map(Preparation::from).collect(),
                existing: step.existing.clone(),
                trigger,
                lookup: step.lookup.clone(),
                expect: step.expect.clone(),
                terminal: step.terminal.clone(),
                promote,
                derive_key: step.derive_key.clone(),
                poll: RetryPolicy::from(&step.poll),
            });
        }

        Ok(Self::new(
            name,
            steps,
            sleeper,
            RetryPolicy::from(&config.actuation_retry),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, entity_id: &str, cancel: &CancellationToken) -> Result<ChainOutcome> {
        tracing::info!(chain = %self.name, entity_id, steps = self.steps.len(), "Starting chain");

        let mut key = entity_id.to_string();
        let mut records = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled {
                    entity_id: entity_id.to_string(),
                    attempts: 0,
                });
            }

            tracing::info!(chain = %self.name, step = %step.name, entity_id, key = %key, "Running step");

            for preparation in &step.preparations {
                self.prepare(step, preparation, entity_id, &key, cancel).await?;
            }

            if let Some(existing) = &step.existing {
                let found = self
                    .read(step, existing, entity_id, &key, cancel)
                    .await?;
                if let Some(row) = found {
                    tracing::info!(
                        chain = %self.name,
                        step = %step.name,
                        entity_id,
                        record = %row,
                        "Record already exists, skipping remaining steps"
                    );
                    return Ok(ChainOutcome::AlreadyReconciled {
                        step: step.name.clone(),
                        key,
                        records,
                    });
                }
            }

            if let Some(trigger) = &step.trigger {
                let context = ActuationContext::for_key(entity_id, &key);
                self.actuate(trigger.as_ref(), &context, cancel).await?;
            }

            let row = self.confirm(step, entity_id, &key, cancel).await?;

            let derived_key = match &step.derive_key {
                Some(column) => row
                    .get(column)
                    .map(str::to_string)
                    .ok_or_else(|| AppError::Precondition {
                        entity_id: entity_id.to_string(),
                        step: step.name.clone(),
                        reason: format!("confirmed record has no {column}"),
                    })?,
                None => key.clone(),
            };

            let lead = LeadRecord::from_row(entity_id, &row);
            tracing::info!(
                chain = %self.name,
                step = %step.name,
                entity_id,
                derived_key = %derived_key,
                status = lead.as_ref().map(|l| l.status.as_str()).unwrap_or("-"),
                "Step confirmed"
            );

            records.push(ReconciliationRecord {
                entity_id: entity_id.to_string(),
                source_key: key,
                derived_key: derived_key.clone(),
                stage: step.name.clone(),
                lead,
            });
            key = derived_key;
        }

        Ok(ChainOutcome::Completed { records })
    }

    async fn prepare(
        &self,
        step: &ChainStep,
        preparation: &Preparation,
        entity_id: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let failed = |reason: String| AppError::Precondition {
            entity_id: entity_id.to_string(),
            step: step.name.clone(),
            reason,
        };

        match preparation {
            Preparation::Guard { statement, expect } => {
                let row = self
                    .read(step, statement, entity_id, key, cancel)
                    .await?
                    .ok_or_else(|| failed(format!("{statement} found no row for {key}")))?;

                for (column, allowed) in expect {
                    let actual = row.get(column);
                    if !actual.map_or(false, |v| allowed.iter().any(|a| a == v)) {
                        return Err(failed(format!(
                            "{column} is {}, expected one of {}",
                            actual.unwrap_or("NULL"),
                            allowed.join(", ")
                        )));
                    }
                }
                tracing::debug!(step = %step.name, statement = %statement, "Guard holds");
            }
            Preparation::Touch {
                statement,
                offset_minutes,
            } => {
                let at = (Local::now().naive_local() + chrono::Duration::minutes(*offset_minutes))
                    .format(TOUCH_FORMAT)
                    .to_string();
                let affected = step
                    .store
                    .execute(statement, &[at.clone(), key.to_string()])
                    .await?;
                if affected == 0 {
                    return Err(failed(format!("{statement} updated no rows for {key}")));
                }
                tracing::info!(step = %step.name, statement = %statement, at = %at, affected, "Touched record");
            }
        }
        Ok(())
    }

    /// One lookup keyed by `key`, retried on the step's budget while the store is unreachable.
    async fn read(
        &self,
        step: &ChainStep,
        statement: &str,
        entity_id: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Row>> {
        let params = [key.to_string()];
        read_retrying(
            &step.poll,
            self.sleeper.as_ref(),
            cancel,
            step.store.name(),
            entity_id,
            || step.store.query_one(statement, &params),
        )
        .await
    }

    async fn actuate(
        &self,
        actuator: &dyn Actuator,
        context: &ActuationContext,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let attempted = self
            .actuation_retry
            .run(self.sleeper.as_ref(), cancel, |attempt| {
                let context = context.with_attempt(attempt);
                async move { actuator.act(&context).await }
            })
            .await
            .map_err(|interrupted| AppError::Cancelled {
                entity_id: context.entity_id.clone(),
                attempts: interrupted.attempts,
            })?;

        match attempted.outcome {
            ActuationOutcome::Success => Ok(attempted.attempts),
            ActuationOutcome::TransientFailure(reason) | ActuationOutcome::HardFailure(reason) => {
                Err(AppError::Actuation {
                    entity_id: context.entity_id.clone(),
                    action: actuator.name().to_string(),
                    attempts: attempted.attempts,
                    reason,
                })
            }
        }
    }

    /// Poll the step's lookup until the expected values show up.
    async fn confirm(
        &self,
        step: &ChainStep,
        entity_id: &str,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Row> {
        let promoted = AtomicBool::new(false);
        let promoted = &promoted;

        let attempted = step
            .poll
            .run(self.sleeper.as_ref(), cancel, |attempt| async move {
                let row = match step.store.query_one(&step.lookup, &[key.to_string()]).await {
                    Ok(Some(row)) => row,
                    Ok(None) => return Ok(PollOutcome::pending()),
                    Err(e) => return absorb_read_error(step.store.name(), entity_id, attempt, e),
                };

                if let Some(state) = step.terminal_match(&row) {
                    return Ok(PollOutcome::TerminalDetected(state));
                }
                if step.is_confirmed(&row) {
                    return Ok(PollOutcome::Confirmed(row));
                }

                if let Some(promote) = &step.promote {
                    let ready = row.get(&promote.column) == Some(promote.when.as_str());
                    if ready && !promoted.swap(true, Ordering::SeqCst) {
                        tracing::info!(step = %step.name, entity_id, key, "Record ready, firing downstream trigger");
                        let context = ActuationContext::for_key(entity_id, key);
                        self.actuate(promote.trigger.as_ref(), &context, cancel).await?;
                    }
                }

                Ok::<_, AppError>(PollOutcome::StillPending {
                    observed: Some(row.to_string()),
                })
            })
            .await
            .map_err(|interrupted| AppError::Cancelled {
                entity_id: entity_id.to_string(),
                attempts: interrupted.attempts,
            })?
            .transpose()?;

        require_confirmed(attempted, entity_id, &step.expectation(), step.store.name())
    }
}
