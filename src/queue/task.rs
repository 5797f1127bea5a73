/// Runs that can be enqueued for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    AdvanceWorkflow {
        entity_id: String,
        /// Read from the status store when absent.
        start: Option<String>,
        target: Option<String>,
    },
    ReconcileChain {
        chain: String,
        entity_id: String,
    },
}

impl Task {
    pub fn entity_id(&self) -> &str {
        match self {
            Task::AdvanceWorkflow { entity_id, .. } => entity_id,
            Task::ReconcileChain { entity_id, .. } => entity_id,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Task::AdvanceWorkflow {
                entity_id, target, ..
            } => format!(
                "Advance {entity_id} to {}",
                target.as_deref().unwrap_or("default target")
            ),
            Task::ReconcileChain { chain, entity_id } => {
                format!("Reconcile {entity_id} through chain {chain}")
            }
        }
    }
}
