//! Bounded convergence polling
//!
//! Evaluates a predicate up to `max_attempts` times, sleeping a fixed
//! interval between evaluations. The run ends on the first converged
//! observation, on the first fatal observation, when the budget is spent, or
//! when the optional cancellation token fires.
//!
//! # Example
//!
//! ```ignore
//! use converge_core::{poll, Outcome, PollSpec};
//!
//! let spec = PollSpec::new("csv phase", 15, Duration::from_secs(30))?;
//! let result = poll(&spec, || async {
//!     match client.get(&CSV, Some(ns), name).await {
//!         Ok(csv) => phase.classify(&csv).into(),
//!         Err(e) => Outcome::FetchFailed(e.to_string()),
//!     }
//! })
//! .await;
//! result.into_result()?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::ConvergeError;
use crate::report::{AttemptReporter, TracingReporter};
use crate::state::Outcome;

/// Configuration of one convergence run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSpec {
    label: String,
    max_attempts: u32,
    interval: Duration,
}

impl PollSpec {
    /// Build a validated poll configuration.
    ///
    /// # Errors
    /// Returns [`ConvergeError::Validation`] when `max_attempts` is zero or
    /// `interval` is zero.
    pub fn new(
        label: impl Into<String>,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<Self, ConvergeError> {
        if max_attempts == 0 {
            return Err(ConvergeError::validation(
                "max_attempts",
                "must be at least 1",
            ));
        }
        if interval.is_zero() {
            return Err(ConvergeError::validation(
                "interval",
                "must be greater than zero",
            ));
        }
        Ok(Self {
            label: label.into(),
            max_attempts,
            interval,
        })
    }

    /// Human-readable label used in logs and errors
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Maximum number of evaluations
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep between evaluations
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Upper bound on time spent sleeping during one run
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Per-call collaborators for a poll or barrier run
#[derive(Clone)]
pub struct PollContext {
    reporter: Arc<dyn AttemptReporter>,
    cancel: Option<CancellationToken>,
    fetch_failure_limit: Option<u32>,
}

impl Default for PollContext {
    fn default() -> Self {
        Self {
            reporter: Arc::new(TracingReporter),
            cancel: None,
            fetch_failure_limit: None,
        }
    }
}

impl std::fmt::Debug for PollContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollContext")
            .field("cancellable", &self.cancel.is_some())
            .field("fetch_failure_limit", &self.fetch_failure_limit)
            .finish()
    }
}

impl PollContext {
    /// Context with the tracing reporter, no cancellation, no escalation
    pub fn new() -> Self {
        Self::default()
    }

    /// Send failed-attempt notices to `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn AttemptReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Stop between attempts once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Treat `limit` consecutive identical fetch failures as fatal.
    ///
    /// Off by default: a failing fetch is retried until the budget runs out.
    /// A limit of zero is ignored.
    pub fn escalate_fetch_failures(mut self, limit: u32) -> Self {
        self.fetch_failure_limit = (limit > 0).then_some(limit);
        self
    }

    pub(crate) fn reporter(&self) -> &dyn AttemptReporter {
        self.reporter.as_ref()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub(crate) fn fetch_tracker(&self) -> FetchFailureTracker {
        FetchFailureTracker::new(self.fetch_failure_limit)
    }

    /// Sleep for `interval`, returning `false` if cancelled first
    pub(crate) async fn pause(&self, interval: Duration) -> bool {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(interval) => true,
                }
            }
            None => {
                tokio::time::sleep(interval).await;
                true
            }
        }
    }
}

/// Counts consecutive identical fetch failures for one target
#[derive(Debug, Clone)]
pub(crate) struct FetchFailureTracker {
    limit: Option<u32>,
    last: Option<String>,
    streak: u32,
}

impl FetchFailureTracker {
    fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            last: None,
            streak: 0,
        }
    }

    /// Pass an outcome through, escalating it if the streak hits the limit
    pub(crate) fn observe(&mut self, outcome: Outcome) -> Outcome {
        let message = match outcome {
            Outcome::FetchFailed(message) => message,
            other => {
                self.last = None;
                self.streak = 0;
                return other;
            }
        };

        if self.last.as_deref() == Some(message.as_str()) {
            self.streak += 1;
        } else {
            self.last = Some(message.clone());
            self.streak = 1;
        }

        match self.limit {
            Some(limit) if self.streak >= limit => Outcome::Fatal(format!(
                "{} consecutive identical fetch failures: {}",
                self.streak, message
            )),
            _ => Outcome::FetchFailed(message),
        }
    }
}

/// One evaluation cycle of a poll run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number
    pub index: u32,
    /// Time since the run started when the attempt began
    pub offset: Duration,
    /// What the predicate reported
    pub outcome: Outcome,
}

/// How a poll run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate reported convergence
    Converged,
    /// The attempt budget ran out
    TimedOut,
    /// The predicate reported a terminal failure
    Fatal(String),
    /// The cancellation token fired
    Cancelled,
}

/// Outcome of a completed poll run
#[derive(Debug, Clone)]
pub struct PollResult {
    /// Label of the run
    pub label: String,
    /// How the run ended
    pub outcome: PollOutcome,
    /// Evaluations performed
    pub attempts: u32,
    /// Budget the run was given
    pub max_attempts: u32,
    /// Wall time from first evaluation to return
    pub elapsed: Duration,
    /// Every evaluation in order
    pub history: Vec<Attempt>,
}

impl PollResult {
    /// Whether the target converged
    pub fn succeeded(&self) -> bool {
        self.outcome == PollOutcome::Converged
    }

    /// Fatal reason, if the run aborted on one
    pub fn fatal(&self) -> Option<&str> {
        match &self.outcome {
            PollOutcome::Fatal(reason) => Some(reason),
            _ => None,
        }
    }

    /// Convert into a `Result`, keeping timeout, fatal and cancellation distinct
    pub fn into_result(self) -> Result<(), ConvergeError> {
        match self.outcome {
            PollOutcome::Converged => Ok(()),
            PollOutcome::TimedOut => Err(ConvergeError::Timeout {
                label: self.label,
                attempts: self.attempts,
                pending: Vec::new(),
            }),
            PollOutcome::Fatal(reason) => Err(ConvergeError::Fatal {
                label: self.label,
                attempts: self.attempts,
                reason,
            }),
            PollOutcome::Cancelled => Err(ConvergeError::Cancelled {
                label: self.label,
                attempts: self.attempts,
            }),
        }
    }
}

/// Poll with the default context (tracing reporter, no cancellation)
pub async fn poll<F, Fut>(spec: &PollSpec, predicate: F) -> PollResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome>,
{
    poll_with(spec, &PollContext::default(), predicate).await
}

/// Poll `predicate` until it converges, turns fatal, or the budget is spent.
///
/// There is no sleep after the converging evaluation or after the final
/// attempt, so a run never sleeps longer than `(max_attempts - 1) * interval`.
pub async fn poll_with<F, Fut>(spec: &PollSpec, ctx: &PollContext, mut predicate: F) -> PollResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome>,
{
    let start = Instant::now();
    let mut history = Vec::with_capacity(spec.max_attempts as usize);
    let mut fetch = ctx.fetch_tracker();

    let finish = |outcome: PollOutcome, attempts: u32, history: Vec<Attempt>| PollResult {
        label: spec.label.clone(),
        outcome,
        attempts,
        max_attempts: spec.max_attempts,
        elapsed: start.elapsed(),
        history,
    };

    for attempt in 1..=spec.max_attempts {
        if ctx.is_cancelled() {
            debug!(label = %spec.label, attempt, "Poll cancelled");
            return finish(PollOutcome::Cancelled, attempt - 1, history);
        }

        let offset = start.elapsed();
        let outcome = fetch.observe(predicate().await);
        history.push(Attempt {
            index: attempt,
            offset,
            outcome: outcome.clone(),
        });

        match outcome {
            Outcome::Converged => {
                debug!(label = %spec.label, attempt, "Converged");
                return finish(PollOutcome::Converged, attempt, history);
            }
            Outcome::Fatal(reason) => {
                error!(label = %spec.label, attempt, reason = %reason, "Fatal condition observed");
                return finish(PollOutcome::Fatal(reason), attempt, history);
            }
            Outcome::FetchFailed(e) => {
                trace!(label = %spec.label, attempt, error = %e, "Observation failed, treating as pending");
            }
            Outcome::Pending => {}
        }

        ctx.reporter()
            .report(&spec.label, attempt, spec.max_attempts);

        if attempt < spec.max_attempts && !ctx.pause(spec.interval).await {
            debug!(label = %spec.label, attempt, "Poll cancelled during sleep");
            return finish(PollOutcome::Cancelled, attempt, history);
        }
    }

    error!(
        label = %spec.label,
        attempts = spec.max_attempts,
        "Poll timed out"
    );
    finish(PollOutcome::TimedOut, spec.max_attempts, history)
}
