//! Phase-reached observer

use super::{pointer_str, Observer, Snapshot};
use crate::state::ObserverState;

/// Default location of a resource phase
pub const STATUS_PHASE_POINTER: &str = "/status/phase";

/// Converged when a phase field equals the target phase exactly.
///
/// Phases listed with [`failing_on`](PhaseReached::failing_on) are terminal
/// and classify as `Failed`. Without any, the observer is two-state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReached {
    pointer: String,
    target: String,
    failure_phases: Vec<String>,
}

impl PhaseReached {
    /// Watch `/status/phase` for `target`
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            pointer: STATUS_PHASE_POINTER.to_string(),
            target: target.into(),
            failure_phases: Vec::new(),
        }
    }

    /// Read the phase from a different JSON pointer
    pub fn at(mut self, pointer: impl Into<String>) -> Self {
        self.pointer = pointer.into();
        self
    }

    /// Treat `phase` as a terminal failure
    pub fn failing_on(mut self, phase: impl Into<String>) -> Self {
        self.failure_phases.push(phase.into());
        self
    }

    /// The phase this observer waits for
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current phase in `snapshot`, if set
    pub fn phase<'a>(&self, snapshot: &'a Snapshot) -> Option<&'a str> {
        pointer_str(snapshot, &self.pointer)
    }
}

impl Observer<Snapshot> for PhaseReached {
    fn classify(&self, snapshot: &Snapshot) -> ObserverState {
        match self.phase(snapshot) {
            Some(phase) if phase == self.target => ObserverState::Converged,
            Some(phase) if self.failure_phases.iter().any(|f| f == phase) => {
                ObserverState::Failed(format!("phase is {}", phase))
            }
            _ => ObserverState::Pending,
        }
    }
}
