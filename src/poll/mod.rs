pub mod poller;
pub mod retry;

pub use poller::{read_retrying, require_confirmed, StateProbe, TransitionPoller};
pub use retry::{Attempted, Interrupted, RetryBudget, RetryPolicy, Sleeper, TokioSleeper};

/// An outcome that may end a retry loop early.
pub trait Settle {
    /// `true` when further attempts cannot change the result.
    fn is_settled(&self) -> bool;
}

/// Errors end the loop: they are returned to the caller as-is.
impl<T: Settle, E> Settle for std::result::Result<T, E> {
    fn is_settled(&self) -> bool {
        match self {
            Ok(outcome) => outcome.is_settled(),
            Err(_) => true,
        }
    }
}

/// Result of one read of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T = String> {
    /// The expected state was observed.
    Confirmed(T),
    /// Not there yet. Carries what was seen, if anything.
    StillPending { observed: Option<String> },
    /// A dead-end state was observed; it will never become the target.
    TerminalDetected(String),
    /// The store could not be read on this attempt.
    StoreUnavailable,
}

impl<T> PollOutcome<T> {
    pub fn pending() -> Self {
        PollOutcome::StillPending { observed: None }
    }

    pub fn observed(&self) -> Option<&str> {
        match self {
            PollOutcome::StillPending { observed } => observed.as_deref(),
            PollOutcome::TerminalDetected(state) => Some(state),
            _ => None,
        }
    }
}

impl<T> Settle for PollOutcome<T> {
    fn is_settled(&self) -> bool {
        matches!(
            self,
            PollOutcome::Confirmed(_) | PollOutcome::TerminalDetected(_)
        )
    }
}
