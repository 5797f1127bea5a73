use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Actuation failed for {entity_id} ({action}) after {attempts} attempt(s): {reason}")]
    Actuation {
        entity_id: String,
        action: String,
        attempts: u32,
        reason: String,
    },

    #[error("{entity_id} is in terminal state {state} (after {attempts} poll attempt(s))")]
    TerminalState {
        entity_id: String,
        state: String,
        attempts: u32,
    },

    #[error(
        "{entity_id} did not reach {target} after {attempts} attempt(s); last observed: {}",
        .last_observed.as_deref().unwrap_or("nothing")
    )]
    ConfirmationTimeout {
        entity_id: String,
        target: String,
        last_observed: Option<String>,
        attempts: u32,
    },

    #[error("Store {store} unavailable while checking {entity_id} ({attempts} attempt(s))")]
    StoreUnavailable {
        store: String,
        entity_id: String,
        attempts: u32,
    },

    #[error("Precondition failed for {entity_id} in step {step}: {reason}")]
    Precondition {
        entity_id: String,
        step: String,
        reason: String,
    },

    #[error("Run for {entity_id} cancelled after {attempts} attempt(s)")]
    Cancelled { entity_id: String, attempts: u32 },

    /// The statement itself failed. Retrying will not help.
    #[error("Store error: {0}")]
    Store(String),

    /// The store could not be reached on this attempt.
    #[error("Store unreachable: {0}")]
    Unreachable(String),

    #[error("Request verification failed: {0}")]
    RequestVerification(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AppError {
    /// Stable name of the failure kind, used in logs and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "configuration",
            AppError::Actuation { .. } => "actuation",
            AppError::TerminalState { .. } => "terminal_state",
            AppError::ConfirmationTimeout { .. } => "confirmation_timeout",
            AppError::StoreUnavailable { .. } => "store_unavailable",
            AppError::Precondition { .. } => "precondition",
            AppError::Cancelled { .. } => "cancelled",
            AppError::Store(_) => "store",
            AppError::Unreachable(_) => "store_unreachable",
            AppError::RequestVerification(_) => "request_verification",
            AppError::Serialization(_) => "serialization",
            AppError::Http(_) => "http",
        }
    }

    /// A terminal state is an expected business result, not a malfunction.
    pub fn is_business_outcome(&self) -> bool {
        matches!(self, AppError::TerminalState { .. })
    }

    /// Connection-class failure that a later attempt may not see.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, AppError::Unreachable(_))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => AppError::Unreachable(e.to_string()),
            _ => AppError::Store(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
