pub mod chain;
pub mod types;

pub use chain::{ChainStep, Preparation, Promotion, ReconciliationChain};
pub use types::{ChainOutcome, LeadRecord, LeadStatus, ReconciliationRecord};
