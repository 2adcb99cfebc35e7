//! Attempt reporting
//!
//! Every failed attempt is announced to a reporter. The default writes a
//! structured `warn!` event; tests swap in [`RecordingReporter`].

use std::sync::Mutex;

use tracing::warn;

/// Receives a notice for each attempt that did not converge
pub trait AttemptReporter: Send + Sync {
    /// Called after attempt `attempt` (1-based) of `max_attempts` failed
    fn report(&self, label: &str, attempt: u32, max_attempts: u32);
}

/// Reports failed attempts as tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl AttemptReporter for TracingReporter {
    fn report(&self, label: &str, attempt: u32, max_attempts: u32) {
        warn!(
            label = %label,
            attempt = attempt,
            max_attempts = max_attempts,
            "Convergence attempt failed"
        );
    }
}

/// Collects reports in memory
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, u32, u32)>>,
}

impl RecordingReporter {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(label, attempt, max_attempts)` triples reported so far
    pub fn reports(&self) -> Vec<(String, u32, u32)> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AttemptReporter for RecordingReporter {
    fn report(&self, label: &str, attempt: u32, max_attempts: u32) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push((label.to_string(), attempt, max_attempts));
        }
    }
}
