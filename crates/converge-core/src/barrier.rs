//! Convergence barrier over a set of independently progressing targets
//!
//! A barrier succeeds only when every target has converged. Targets are
//! tracked in an explicit state map: once a target converges it is never
//! evaluated again for the rest of the run, because re-reading a transient
//! resource after it converged can observe an unrelated later state. The
//! attempt budget applies to the barrier as a whole, one round per attempt.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::error::ConvergeError;
use crate::poll::{FetchFailureTracker, PollContext, PollSpec};
use crate::state::{ObserverState, Outcome};

/// One member of a barrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTarget<T> {
    /// Identifier, unique within the barrier
    pub id: T,
    /// Classification after the last evaluation
    pub state: ObserverState,
    /// Number of times the evaluator was invoked for this target
    pub evaluations: u32,
    /// Last fetch error or fatal reason, for diagnostics
    pub last_detail: Option<String>,
}

impl<T> SubTarget<T> {
    fn new(id: T) -> Self {
        Self {
            id,
            state: ObserverState::Unseen,
            evaluations: 0,
            last_detail: None,
        }
    }

    fn record(&mut self, outcome: Outcome) {
        self.evaluations += 1;
        self.last_detail = match &outcome {
            Outcome::FetchFailed(e) | Outcome::Fatal(e) => Some(e.clone()),
            Outcome::Converged | Outcome::Pending => None,
        };
        let state = std::mem::take(&mut self.state);
        self.state = state.advance(&outcome);
    }
}

/// Outcome of a barrier run
#[derive(Debug, Clone)]
pub struct BarrierResult<T: Ord> {
    /// Label of the run
    pub label: String,
    /// Targets that converged
    pub converged: BTreeSet<T>,
    /// Targets that did not converge (includes failed and never-observed)
    pub pending: BTreeSet<T>,
    /// Pending targets for which no snapshot was ever obtained
    pub never_observed: BTreeSet<T>,
    /// Targets that reported a terminal failure, with the reason
    pub failed: BTreeMap<T, String>,
    /// Rounds executed
    pub rounds: u32,
    /// Whether the run stopped on cancellation
    pub cancelled: bool,
    /// Wall time of the run
    pub elapsed: Duration,
    /// Final per-target bookkeeping
    pub targets: Vec<SubTarget<T>>,
}

impl<T: Ord + Clone + Display> BarrierResult<T> {
    fn from_targets(
        label: &str,
        targets: BTreeMap<T, (SubTarget<T>, FetchFailureTracker)>,
        rounds: u32,
        cancelled: bool,
        elapsed: Duration,
    ) -> Self {
        let mut converged = BTreeSet::new();
        let mut pending = BTreeSet::new();
        let mut never_observed = BTreeSet::new();
        let mut failed = BTreeMap::new();
        let mut subs = Vec::with_capacity(targets.len());

        for (id, (sub, _)) in targets {
            match &sub.state {
                ObserverState::Converged => {
                    converged.insert(id);
                }
                ObserverState::Unseen => {
                    never_observed.insert(id.clone());
                    pending.insert(id);
                }
                ObserverState::Pending => {
                    pending.insert(id);
                }
                ObserverState::Failed(reason) => {
                    failed.insert(id.clone(), reason.clone());
                    pending.insert(id);
                }
            }
            subs.push(sub);
        }

        Self {
            label: label.to_string(),
            converged,
            pending,
            never_observed,
            failed,
            rounds,
            cancelled,
            elapsed,
            targets: subs,
        }
    }

    /// Whether every target converged
    pub fn succeeded(&self) -> bool {
        self.pending.is_empty()
    }

    /// Convert into a `Result`, keeping fatal, cancellation and timeout distinct
    pub fn into_result(self) -> Result<(), ConvergeError> {
        if self.succeeded() {
            return Ok(());
        }
        if !self.failed.is_empty() {
            let reason = self
                .failed
                .iter()
                .map(|(id, reason)| format!("{}: {}", id, reason))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConvergeError::Fatal {
                label: self.label,
                attempts: self.rounds,
                reason,
            });
        }
        if self.cancelled {
            return Err(ConvergeError::Cancelled {
                label: self.label,
                attempts: self.rounds,
            });
        }
        let pending = self
            .pending
            .iter()
            .map(|id| {
                if self.never_observed.contains(id) {
                    format!("{} (never observed)", id)
                } else {
                    id.to_string()
                }
            })
            .collect();
        Err(ConvergeError::Timeout {
            label: self.label,
            attempts: self.rounds,
            pending,
        })
    }
}

/// Run a barrier with the default context
pub async fn await_all<T, I, F, Fut>(spec: &PollSpec, targets: I, evaluate: F) -> BarrierResult<T>
where
    T: Ord + Clone + Display,
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Outcome>,
{
    await_all_with(spec, &PollContext::default(), targets, evaluate).await
}

/// Wait until every target converges, one evaluation per unsettled target per round.
///
/// Targets are evaluated sequentially in identifier order. After each round
/// the barrier succeeds if all targets converged, fails if any target
/// reported a fatal outcome, and otherwise sleeps `spec.interval()` before
/// the next round. An empty target set succeeds immediately.
pub async fn await_all_with<T, I, F, Fut>(
    spec: &PollSpec,
    ctx: &PollContext,
    targets: I,
    mut evaluate: F,
) -> BarrierResult<T>
where
    T: Ord + Clone + Display,
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Outcome>,
{
    let start = Instant::now();
    let mut states: BTreeMap<T, (SubTarget<T>, FetchFailureTracker)> = targets
        .into_iter()
        .map(|id| (id.clone(), (SubTarget::new(id), ctx.fetch_tracker())))
        .collect();

    if states.is_empty() {
        debug!(label = %spec.label(), "Barrier has no targets");
        return BarrierResult::from_targets(spec.label(), states, 0, false, start.elapsed());
    }

    let mut rounds = 0;
    for round in 1..=spec.max_attempts() {
        if ctx.is_cancelled() {
            return BarrierResult::from_targets(spec.label(), states, rounds, true, start.elapsed());
        }

        for (id, (sub, fetch)) in states.iter_mut() {
            if sub.state.is_settled() {
                continue;
            }
            let outcome = fetch.observe(evaluate(id.clone()).await);
            trace!(label = %spec.label(), target = %id, round, outcome = %outcome, "Evaluated target");
            if outcome.is_converged() {
                info!(label = %spec.label(), target = %id, round, "Target converged");
            }
            sub.record(outcome);
        }
        rounds = round;

        let remaining = states
            .values()
            .filter(|(sub, _)| sub.state != ObserverState::Converged)
            .count();
        if remaining == 0 {
            debug!(label = %spec.label(), rounds, "All targets converged");
            return BarrierResult::from_targets(spec.label(), states, rounds, false, start.elapsed());
        }

        let any_failed = states
            .values()
            .any(|(sub, _)| matches!(sub.state, ObserverState::Failed(_)));
        if any_failed {
            error!(label = %spec.label(), rounds, "Target entered a terminal failure state");
            return BarrierResult::from_targets(spec.label(), states, rounds, false, start.elapsed());
        }

        debug!(label = %spec.label(), round, remaining, "Targets still pending");
        ctx.reporter()
            .report(spec.label(), round, spec.max_attempts());

        if round < spec.max_attempts() && !ctx.pause(spec.interval()).await {
            return BarrierResult::from_targets(spec.label(), states, rounds, true, start.elapsed());
        }
    }

    error!(label = %spec.label(), rounds, "Barrier timed out");
    BarrierResult::from_targets(spec.label(), states, rounds, false, start.elapsed())
}
