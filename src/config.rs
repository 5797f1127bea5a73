use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::{AppError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub stores: HashMap<String, StoreConfig>,
    #[serde(default)]
    pub workflow: Option<WorkflowConfig>,
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Deserialize, Clone, Default)]
pub struct ApiConfig {
    /// Shared secret for `X-Loanflow-Signature-256`.
    #[serde(default)]
    pub secret: String,
}

// Manual Debug impl to avoid leaking the request secret
impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct StoreConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Statement key to query text. Parameters are positional `?`.
    #[serde(default)]
    pub statements: HashMap<String, String>,
}

// Manual Debug impl: the URL carries credentials
impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("statements", &self.statements.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Attempt count and fixed interval for one retry call site.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl PollConfig {
    /// 12 x 5 s, used while waiting for a review stage.
    pub fn stage_confirmation() -> Self {
        Self {
            max_attempts: 12,
            interval_ms: 5_000,
        }
    }

    /// 20 x 15 s, used while waiting for a record in a downstream store.
    pub fn chain_step() -> Self {
        Self {
            max_attempts: 20,
            interval_ms: 15_000,
        }
    }

    pub fn actuation_retry() -> Self {
        Self {
            max_attempts: 3,
            interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMethod {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TriggerConfig {
    /// May contain `{entity_id}`, `{key}`, `{from}` and `{to}`.
    pub url: String,
    #[serde(default)]
    pub method: TriggerMethod,
    #[serde(default = "default_success_status")]
    pub success_status: Vec<u16>,
    #[serde(default = "default_transient_status")]
    pub transient_status: Vec<u16>,
    #[serde(default = "default_transient_markers")]
    pub transient_markers: Vec<String>,
    #[serde(default = "default_trigger_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

impl TriggerConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: TriggerMethod::default(),
            success_status: default_success_status(),
            transient_status: default_transient_status(),
            transient_markers: default_transient_markers(),
            timeout_secs: default_trigger_timeout_secs(),
            basic_auth: None,
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

// Manual Debug impl to avoid leaking the password
impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
    #[serde(default = "default_terminal_states")]
    pub terminal_states: Vec<String>,
    /// Stage a run stops at when none is given. Defaults to the last stage.
    #[serde(default)]
    pub target: Option<String>,
    /// Store holding the review status.
    #[serde(default = "default_status_store")]
    pub store: String,
    #[serde(default = "default_status_statement")]
    pub status_statement: String,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "PollConfig::stage_confirmation")]
    pub poll: PollConfig,
    #[serde(default = "PollConfig::actuation_retry")]
    pub actuation_retry: PollConfig,
    pub actuator: TriggerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub steps: Vec<StepConfig>,
    #[serde(default = "PollConfig::actuation_retry")]
    pub actuation_retry: PollConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StepConfig {
    pub name: String,
    pub store: String,
    #[serde(default)]
    pub prepare: Vec<PrepareConfig>,
    /// Statement that finds an already reconciled record for the step key.
    #[serde(default)]
    pub existing: Option<String>,
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,
    /// Statement polled for the record this step waits on.
    pub lookup: String,
    /// Column values the record must show to count as confirmed.
    #[serde(default)]
    pub expect: BTreeMap<String, Vec<String>>,
    /// Column values that end the poll as a terminal failure.
    #[serde(default)]
    pub terminal: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub promote: Option<PromoteConfig>,
    /// Column of the confirmed record that keys the next step.
    #[serde(default)]
    pub derive_key: Option<String>,
    #[serde(default = "PollConfig::chain_step")]
    pub poll: PollConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrepareConfig {
    Guard {
        statement: String,
        expect: BTreeMap<String, Vec<String>>,
    },
    Touch {
        statement: String,
        #[serde(default)]
        offset_minutes: i64,
    },
}

/// Fire a downstream trigger once when the record reaches a ready sub-status.
#[derive(Debug, Deserialize, Clone)]
pub struct PromoteConfig {
    pub column: String,
    #[serde(default = "default_promote_when")]
    pub when: String,
    pub trigger: TriggerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_probe_status")]
    pub expect_status: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_connections() -> u32 {
    4
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_success_status() -> Vec<u16> {
    vec![200, 204]
}

fn default_transient_status() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_transient_markers() -> Vec<String> {
    vec!["Gateway Time-out".to_string()]
}

fn default_trigger_timeout_secs() -> u64 {
    30
}

fn default_stages() -> Vec<String> {
    [
        "DOCS_UPLOADED",
        "PENDING_REVIEW",
        "FRAUD_REVIEW",
        "NACH_EMAIL_SENT",
        "KYC_VERIFICATION",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_terminal_states() -> Vec<String> {
    vec!["TEST_IGNORE".to_string(), "REJECTED".to_string()]
}

fn default_status_store() -> String {
    "lending".to_string()
}

fn default_status_statement() -> String {
    "review_status".to_string()
}

fn default_status_column() -> String {
    "user_data_review_status".to_string()
}

fn default_promote_when() -> String {
    crate::reconcile::LeadStatus::ReadyToAdd.as_str().to_string()
}

fn default_probe_status() -> u16 {
    200
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(config::File::with_name("loanflow").required(false));
        }

        // Environment variable overrides with LOANFLOW_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("LOANFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let config: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks the deserializer cannot express.
    pub fn validate(&self) -> Result<()> {
        if let Some(workflow) = &self.workflow {
            self.require_store(&workflow.store, "workflow")?;
        }

        for (name, chain) in &self.chains {
            if chain.steps.is_empty() {
                return Err(AppError::Config(format!("Chain {name} has no steps")));
            }
            for step in &chain.steps {
                self.require_store(&step.store, &format!("chain {name} step {}", step.name))?;
                if step.expect.is_empty() {
                    return Err(AppError::Config(format!(
                        "Chain {name} step {} has no expected values",
                        step.name
                    )));
                }
            }
        }

        if self.runs.max_concurrent == 0 {
            return Err(AppError::Config(
                "runs.max_concurrent must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    fn require_store(&self, store: &str, used_by: &str) -> Result<()> {
        if self.stores.contains_key(store) {
            Ok(())
        } else {
            Err(AppError::Config(format!(
                "Unknown store {store} referenced by {used_by}"
            )))
        }
    }

    pub fn api_secret(&self) -> &str {
        &self.api.secret
    }
}
