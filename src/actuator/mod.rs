pub mod http;

use async_trait::async_trait;

use crate::poll::Settle;

/// What an actuator is asked to do on one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuationContext {
    pub entity_id: String,
    /// Lookup key for the current step. Equals `entity_id` unless a chain derived a new one.
    pub key: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl ActuationContext {
    pub fn for_key(entity_id: &str, key: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            key: key.to_string(),
            from: None,
            to: None,
            attempt: 1,
        }
    }

    pub fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn describe(&self) -> String {
        match (&self.from, &self.to) {
            (Some(from), Some(to)) => format!("{from} -> {to}"),
            (None, Some(to)) => format!("-> {to}"),
            _ => format!("trigger for {}", self.key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuationOutcome {
    Success,
    /// Recoverable: the same action may be retried.
    TransientFailure(String),
    HardFailure(String),
}

impl Settle for ActuationOutcome {
    fn is_settled(&self) -> bool {
        !matches!(self, ActuationOutcome::TransientFailure(_))
    }
}

/// Performs the external action that should cause a state change.
#[async_trait]
pub trait Actuator: Send + Sync {
    fn name(&self) -> &str;

    async fn act(&self, context: &ActuationContext) -> ActuationOutcome;
}
