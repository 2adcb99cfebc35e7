//! State observers
//!
//! An observer turns one snapshot of external state into an
//! [`ObserverState`]. Observers are pure: fetching the snapshot is the
//! caller's job, and [`observe`] folds a failed fetch into
//! [`Outcome::FetchFailed`] so that a transient API error never aborts a
//! poll on its own.
//!
//! - [`PhaseReached`] - a phase field equals a target value
//! - [`CountMatches`] - a ready count equals a desired count in one snapshot
//! - [`PatternInLog`] - accumulated text contains every required substring
//! - [`LabelPresent`] - a metadata label or annotation is present
//! - [`ServiceState`] - an external service reports a success token

mod count;
mod label;
mod log;
mod phase;
mod service;

use std::fmt::Display;

pub use count::CountMatches;
pub use label::{LabelPresent, MetadataField};
pub use log::PatternInLog;
pub use phase::PhaseReached;
pub use service::ServiceState;

use crate::state::{ObserverState, Outcome};

/// A point-in-time read of an external resource, as JSON
pub type Snapshot = serde_json::Value;

/// Classifies a snapshot of external state
pub trait Observer<S: ?Sized> {
    /// Classify one snapshot. Never returns [`ObserverState::Unseen`].
    fn classify(&self, snapshot: &S) -> ObserverState;
}

impl<S: ?Sized, F> Observer<S> for F
where
    F: Fn(&S) -> ObserverState,
{
    fn classify(&self, snapshot: &S) -> ObserverState {
        self(snapshot)
    }
}

/// Classify the result of a fetch.
///
/// A failed fetch becomes [`Outcome::FetchFailed`] (pending), never fatal.
pub fn observe<S, E, O>(fetched: Result<S, E>, observer: &O) -> Outcome
where
    E: Display,
    O: Observer<S> + ?Sized,
{
    match fetched {
        Ok(snapshot) => observer.classify(&snapshot).into(),
        Err(e) => Outcome::FetchFailed(e.to_string()),
    }
}

/// Classify a fetch whose success criterion is that the resource is gone.
///
/// Converged when the fetch fails with an error `is_gone` recognises
/// (typically HTTP 404), pending while the resource still exists, and a
/// fetch failure for any other error.
pub fn observe_absence<S, E, G>(fetched: Result<S, E>, is_gone: G) -> Outcome
where
    E: Display,
    G: Fn(&E) -> bool,
{
    match fetched {
        Ok(_) => Outcome::Pending,
        Err(e) if is_gone(&e) => Outcome::Converged,
        Err(e) => Outcome::FetchFailed(e.to_string()),
    }
}

/// Read a JSON pointer as an integer, if present
pub(crate) fn pointer_i64(snapshot: &Snapshot, pointer: &str) -> Option<i64> {
    snapshot.pointer(pointer).and_then(|v| v.as_i64())
}

/// Read a JSON pointer as a string, if present
pub(crate) fn pointer_str<'a>(snapshot: &'a Snapshot, pointer: &str) -> Option<&'a str> {
    snapshot.pointer(pointer).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fetch_errors_are_pending_not_fatal() {
        let phase = PhaseReached::new("Succeeded").failing_on("Failed");
        let fetched: Result<Snapshot, String> = Err("etcdserver: request timed out".to_string());
        let outcome = observe(fetched, &phase);
        assert_eq!(
            outcome,
            Outcome::FetchFailed("etcdserver: request timed out".to_string())
        );
        assert!(!outcome.is_fatal());
    }

    #[test]
    fn successful_fetch_is_classified() {
        let phase = PhaseReached::new("Succeeded").failing_on("Failed");
        let ok: Result<Snapshot, String> = Ok(json!({"status": {"phase": "Succeeded"}}));
        assert_eq!(observe(ok, &phase), Outcome::Converged);

        let failed: Result<Snapshot, String> = Ok(json!({"status": {"phase": "Failed"}}));
        assert!(observe(failed, &phase).is_fatal());
    }

    #[test]
    fn closures_are_observers() {
        let non_empty = |pods: &Vec<Snapshot>| {
            if pods.is_empty() {
                ObserverState::Pending
            } else {
                ObserverState::Converged
            }
        };
        let none: Result<Vec<Snapshot>, String> = Ok(vec![]);
        assert_eq!(observe(none, &non_empty), Outcome::Pending);
        let some: Result<Vec<Snapshot>, String> = Ok(vec![json!({})]);
        assert_eq!(observe(some, &non_empty), Outcome::Converged);
    }

    #[test]
    fn absence_converges_only_on_recognised_error() {
        let is_404 = |e: &String| e.contains("404");

        let still_there: Result<Snapshot, String> = Ok(json!({}));
        assert_eq!(observe_absence(still_there, is_404), Outcome::Pending);

        let gone: Result<Snapshot, String> = Err("404 not found".to_string());
        assert_eq!(observe_absence(gone, is_404), Outcome::Converged);

        let broken: Result<Snapshot, String> = Err("connection reset".to_string());
        assert_eq!(
            observe_absence(broken, is_404),
            Outcome::FetchFailed("connection reset".to_string())
        );
    }
}
