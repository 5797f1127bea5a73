use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ProbeConfig};
use crate::error::{AppError, Result};
use crate::health::{check_services, ProbeReport};
use crate::poll::{Sleeper, TokioSleeper};
use crate::queue::task::Task;
use crate::reconcile::{ChainOutcome, ReconciliationChain};
use crate::store::StoreRegistry;
use crate::workflow::{RunReport, WorkflowDriver};

/// Result of one queued or one-shot run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunResult {
    Workflow(RunReport),
    Chain(ChainOutcome),
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub name: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub stores: Vec<StoreStatus>,
    pub services: Vec<ProbeReport>,
}

impl HealthReport {
    pub fn all_up(&self) -> bool {
        self.stores.iter().all(|s| s.available) && self.services.iter().all(|s| s.up)
    }
}

/// Everything a run needs, built once from configuration.
pub struct Engine {
    client: reqwest::Client,
    stores: StoreRegistry,
    driver: Option<WorkflowDriver>,
    chains: HashMap<String, ReconciliationChain>,
    probes: Vec<ProbeConfig>,
}

impl Engine {
    pub fn new(
        client: reqwest::Client,
        stores: StoreRegistry,
        driver: Option<WorkflowDriver>,
        chains: HashMap<String, ReconciliationChain>,
        probes: Vec<ProbeConfig>,
    ) -> Self {
        Self {
            client,
            stores,
            driver,
            chains,
            probes,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("loanflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let stores = StoreRegistry::from_config(&config.stores)?;
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);

        let driver = config
            .workflow
            .as_ref()
            .map(|w| WorkflowDriver::from_config(w, &stores, client.clone(), Arc::clone(&sleeper)))
            .transpose()?;

        let mut chains = HashMap::new();
        for (name, chain) in &config.chains {
            chains.insert(
                name.clone(),
                ReconciliationChain::from_config(name, chain, &stores, &client, Arc::clone(&sleeper))?,
            );
        }

        tracing::info!(
            stores = ?stores.names(),
            workflow = driver.is_some(),
            chains = chains.len(),
            probes = config.probes.len(),
            "Engine ready"
        );

        Ok(Self::new(client, stores, driver, chains, config.probes.clone()))
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    pub fn has_chain(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    pub fn has_workflow(&self) -> bool {
        self.driver.is_some()
    }

    /// Advance an application. Without `start`, the current stage is read from the status store.
    pub async fn advance(
        &self,
        entity_id: &str,
        start: Option<&str>,
        target: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| AppError::Config("No workflow configured".to_string()))?;

        match start {
            Some(start) => {
                let target = target.unwrap_or_else(|| driver.default_target());
                driver.run(entity_id, start, target, cancel).await
            }
            None => driver.run_from_store(entity_id, target, cancel).await,
        }
    }

    pub async fn reconcile(
        &self,
        chain: &str,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainOutcome> {
        let chain = self
            .chains
            .get(chain)
            .ok_or_else(|| AppError::Config(format!("Unknown chain: {chain}")))?;
        chain.run(entity_id, cancel).await
    }

    pub async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<RunResult> {
        match task {
            Task::AdvanceWorkflow {
                entity_id,
                start,
                target,
            } => self
                .advance(entity_id, start.as_deref(), target.as_deref(), cancel)
                .await
                .map(RunResult::Workflow),
            Task::ReconcileChain { chain, entity_id } => self
                .reconcile(chain, entity_id, cancel)
                .await
                .map(RunResult::Chain),
        }
    }

    pub async fn check(&self) -> HealthReport {
        let stores = self
            .stores
            .check_all()
            .await
            .into_iter()
            .map(|(name, available)| StoreStatus { name, available })
            .collect();
        let services = check_services(&self.client, &self.probes).await;
        HealthReport { stores, services }
    }

    pub async fn close(&self) {
        self.stores.close_all().await;
    }
}
