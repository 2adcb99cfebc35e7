//! Observation outcomes and per-target classification

use std::fmt;

/// Result of one evaluation of a convergence predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The target reached the desired state
    Converged,
    /// Observed, but not there yet
    Pending,
    /// The observation itself failed (API error, network blip).
    ///
    /// Treated as pending unless the poll context escalates repeated
    /// identical failures.
    FetchFailed(String),
    /// The target can never converge without outside intervention
    Fatal(String),
}

impl Outcome {
    /// Whether this outcome ends the poll successfully
    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::Converged)
    }

    /// Whether this outcome aborts the poll
    pub fn is_fatal(&self) -> bool {
        matches!(self, Outcome::Fatal(_))
    }

    /// Map a boolean check into converged/pending
    pub fn from_bool(converged: bool) -> Self {
        if converged {
            Outcome::Converged
        } else {
            Outcome::Pending
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Converged => write!(f, "converged"),
            Outcome::Pending => write!(f, "pending"),
            Outcome::FetchFailed(e) => write!(f, "fetch failed: {}", e),
            Outcome::Fatal(e) => write!(f, "fatal: {}", e),
        }
    }
}

/// Classification of a single target from the snapshots seen so far
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ObserverState {
    /// No snapshot has been obtained yet
    #[default]
    Unseen,
    /// A snapshot was obtained but the target has not converged
    Pending,
    /// The target converged
    Converged,
    /// The target entered a terminal failure state
    Failed(String),
}

impl ObserverState {
    /// Whether no further evaluation is needed for this target
    pub fn is_settled(&self) -> bool {
        matches!(self, ObserverState::Converged | ObserverState::Failed(_))
    }

    /// Fold one evaluation outcome into the current state.
    ///
    /// A failed fetch tells us nothing new, so it keeps the previous
    /// classification (an `Unseen` target stays unseen). Settled states never
    /// move.
    pub fn advance(self, outcome: &Outcome) -> ObserverState {
        if self.is_settled() {
            return self;
        }
        match outcome {
            Outcome::Converged => ObserverState::Converged,
            Outcome::Pending => ObserverState::Pending,
            Outcome::FetchFailed(_) => self,
            Outcome::Fatal(reason) => ObserverState::Failed(reason.clone()),
        }
    }
}

impl From<ObserverState> for Outcome {
    fn from(state: ObserverState) -> Self {
        match state {
            ObserverState::Unseen | ObserverState::Pending => Outcome::Pending,
            ObserverState::Converged => Outcome::Converged,
            ObserverState::Failed(reason) => Outcome::Fatal(reason),
        }
    }
}

impl fmt::Display for ObserverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserverState::Unseen => write!(f, "unseen"),
            ObserverState::Pending => write!(f, "pending"),
            ObserverState::Converged => write!(f, "converged"),
            ObserverState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
