//! Count-matches observer

use super::{pointer_i64, Observer, Snapshot};
use crate::state::ObserverState;

/// Converged when a ready count equals a desired count.
///
/// Both counts come from the same snapshot, so they are always read
/// atomically. Kubernetes omits zero-valued status counters, so a missing
/// ready count reads as zero; a missing desired count means the controller has
/// not reported yet and stays pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMatches {
    ready: String,
    desired: String,
    require_nonzero: bool,
}

impl CountMatches {
    /// Compare the integers at two JSON pointers
    pub fn new(ready: impl Into<String>, desired: impl Into<String>) -> Self {
        Self {
            ready: ready.into(),
            desired: desired.into(),
            require_nonzero: false,
        }
    }

    /// DaemonSet: `status.numberReady == status.desiredNumberScheduled`
    pub fn daemonset() -> Self {
        Self::new("/status/numberReady", "/status/desiredNumberScheduled")
    }

    /// MachineSet: `status.readyReplicas == spec.replicas`
    pub fn machineset() -> Self {
        Self::new("/status/readyReplicas", "/spec/replicas")
    }

    /// Do not treat `0 == 0` as converged
    pub fn require_nonzero(mut self) -> Self {
        self.require_nonzero = true;
        self
    }

    /// `(ready, desired)` as read from `snapshot`
    pub fn counts(&self, snapshot: &Snapshot) -> (i64, Option<i64>) {
        (
            pointer_i64(snapshot, &self.ready).unwrap_or(0),
            pointer_i64(snapshot, &self.desired),
        )
    }
}

impl Observer<Snapshot> for CountMatches {
    fn classify(&self, snapshot: &Snapshot) -> ObserverState {
        match self.counts(snapshot) {
            (_, None) => ObserverState::Pending,
            (0, Some(0)) if self.require_nonzero => ObserverState::Pending,
            (ready, Some(desired)) if ready == desired => ObserverState::Converged,
            _ => ObserverState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn daemonset_ready_when_counts_match() {
        let observer = CountMatches::daemonset();
        let ready = json!({"status": {"numberReady": 3, "desiredNumberScheduled": 3}});
        let rolling = json!({"status": {"numberReady": 2, "desiredNumberScheduled": 3}});
        assert_eq!(observer.classify(&ready), ObserverState::Converged);
        assert_eq!(observer.classify(&rolling), ObserverState::Pending);
    }

    #[test]
    fn missing_ready_count_reads_as_zero() {
        let observer = CountMatches::machineset();
        let scaling = json!({"spec": {"replicas": 2}, "status": {}});
        assert_eq!(observer.counts(&scaling), (0, Some(2)));
        assert_eq!(observer.classify(&scaling), ObserverState::Pending);

        let done = json!({"spec": {"replicas": 2}, "status": {"readyReplicas": 2}});
        assert_eq!(observer.classify(&done), ObserverState::Converged);
    }

    #[test]
    fn missing_desired_count_is_pending() {
        let observer = CountMatches::daemonset();
        assert_eq!(
            observer.classify(&json!({"status": {"numberReady": 0}})),
            ObserverState::Pending
        );
    }

    #[test]
    fn empty_fleet_needs_opt_in_to_count_as_pending() {
        let empty = json!({"status": {"numberReady": 0, "desiredNumberScheduled": 0}});
        assert_eq!(
            CountMatches::daemonset().classify(&empty),
            ObserverState::Converged
        );
        assert_eq!(
            CountMatches::daemonset().require_nonzero().classify(&empty),
            ObserverState::Pending
        );
    }
}
