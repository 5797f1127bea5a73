pub mod driver;
pub mod stages;
pub mod types;

pub use driver::WorkflowDriver;
pub use stages::{StageSequence, WorkflowState};
pub use types::{RunReport, StepReport, TransitionRequest};
