use std::collections::HashSet;

use crate::error::{AppError, Result};

/// A named point in the review workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowState {
    pub name: String,
    /// No automated progress is possible from here.
    pub terminal: bool,
}

/// Ordered review stages plus the unordered set of dead-end states.
#[derive(Debug, Clone)]
pub struct StageSequence {
    stages: Vec<String>,
    terminal: HashSet<String>,
}

impl StageSequence {
    pub fn new(stages: Vec<String>, terminal: impl IntoIterator<Item = String>) -> Result<Self> {
        if stages.is_empty() {
            return Err(AppError::Config("Stage sequence is empty".to_string()));
        }

        let terminal: HashSet<String> = terminal.into_iter().collect();
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.as_str()) {
                return Err(AppError::Config(format!("Duplicate stage {stage}")));
            }
            if terminal.contains(stage) {
                return Err(AppError::Config(format!(
                    "Stage {stage} is also listed as terminal"
                )));
            }
        }

        Ok(Self { stages, terminal })
    }

    /// The configured successor of `current`.
    pub fn advance(&self, current: &str) -> Result<&str> {
        let position = self.position(current).ok_or_else(|| {
            AppError::Config(format!("{current} is not a stage in the sequence"))
        })?;
        self.stages
            .get(position + 1)
            .map(String::as_str)
            .ok_or_else(|| AppError::Config(format!("{current} is the last stage")))
    }

    pub fn position(&self, state: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == state)
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal.contains(state)
    }

    pub fn state(&self, name: &str) -> Option<WorkflowState> {
        if self.is_terminal(name) || self.position(name).is_some() {
            Some(WorkflowState {
                name: name.to_string(),
                terminal: self.is_terminal(name),
            })
        } else {
            None
        }
    }

    pub fn terminal_states(&self) -> &HashSet<String> {
        &self.terminal
    }

    pub fn last(&self) -> &str {
        // Non-empty by construction.
        self.stages.last().map(String::as_str).unwrap_or_default()
    }
}
