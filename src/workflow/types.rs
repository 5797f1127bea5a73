use serde::Serialize;

use crate::actuator::ActuationContext;

/// One attempted step. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub entity_id: String,
    pub current: String,
    pub target: String,
    pub store: String,
}

impl TransitionRequest {
    pub fn new(entity_id: &str, current: &str, target: &str, store: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            current: current.to_string(),
            target: target.to_string(),
            store: store.to_string(),
        }
    }

    pub fn context(&self) -> ActuationContext {
        ActuationContext {
            entity_id: self.entity_id.clone(),
            key: self.entity_id.clone(),
            from: Some(self.current.clone()),
            to: Some(self.target.clone()),
            attempt: 1,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} -> {}", self.current, self.target)
    }
}

/// A confirmed step of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub from: String,
    pub to: String,
    pub actuation_attempts: u32,
    pub poll_attempts: u32,
}

/// Outcome of a successful workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub entity_id: String,
    pub final_state: String,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn actuations(&self) -> u32 {
        self.steps.iter().map(|s| s.actuation_attempts).sum()
    }
}
