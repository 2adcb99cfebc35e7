//! External-service-state observer

use super::{pointer_str, Observer, Snapshot};
use crate::state::ObserverState;

/// Response `kind` that marks an error body rather than a resource
pub const ERROR_KIND: &str = "Error";

/// Converged when a remote call reports the success token in its `state`.
///
/// Failure tokens (e.g. `failed`, `deleting`) never self-heal and classify
/// as `Failed`. A response with no `kind`, or of kind `Error`, is an
/// unanswered call and stays pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    success: String,
    failures: Vec<String>,
}

impl ServiceState {
    /// Wait for `state == success`
    pub fn new(success: impl Into<String>) -> Self {
        Self {
            success: success.into(),
            failures: Vec::new(),
        }
    }

    /// Treat each of `tokens` as a terminal failure
    pub fn failing_on<I, P>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.failures.extend(tokens.into_iter().map(Into::into));
        self
    }
}

impl Observer<Snapshot> for ServiceState {
    fn classify(&self, response: &Snapshot) -> ObserverState {
        match pointer_str(response, "/kind") {
            None | Some("") | Some(ERROR_KIND) => return ObserverState::Pending,
            Some(_) => {}
        }
        match pointer_str(response, "/state") {
            Some(state) if state == self.success => ObserverState::Converged,
            Some(state) if self.failures.iter().any(|f| f == state) => {
                ObserverState::Failed(format!("service state is {}", state))
            }
            _ => ObserverState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addon() -> ServiceState {
        ServiceState::new("ready").failing_on(["failed", "deleting"])
    }

    #[test]
    fn ready_converges() {
        let resp = json!({"kind": "AddOnInstallation", "state": "ready"});
        assert_eq!(addon().classify(&resp), ObserverState::Converged);
    }

    #[test]
    fn installing_is_pending() {
        let resp = json!({"kind": "AddOnInstallation", "state": "installing"});
        assert_eq!(addon().classify(&resp), ObserverState::Pending);
    }

    #[test]
    fn failure_tokens_are_terminal() {
        for state in ["failed", "deleting"] {
            let resp = json!({"kind": "AddOnInstallation", "state": state});
            assert!(matches!(addon().classify(&resp), ObserverState::Failed(_)));
        }
    }

    #[test]
    fn error_bodies_and_empty_responses_are_pending() {
        let error = json!({"kind": "Error", "code": "CLUSTERS-MGMT-404", "state": "failed"});
        assert_eq!(addon().classify(&error), ObserverState::Pending);
        assert_eq!(addon().classify(&json!({})), ObserverState::Pending);
        assert_eq!(
            addon().classify(&json!({"kind": "", "state": "ready"})),
            ObserverState::Pending
        );
    }
}
