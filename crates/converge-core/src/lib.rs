//! Bounded convergence for eventually consistent control planes
//!
//! A write to an API server returns immediately, but the state it asks for
//! shows up later. This crate provides the pieces used to wait for it:
//!
//! - [`poll`] - evaluate a predicate up to N times, a fixed interval apart
//! - [`barrier`] - wait for a set of sub-targets, memoizing those that converged
//! - [`observer`] - classify snapshots (phase, counts, logs, labels, service state)
//! - [`report`] - per-attempt progress notices
//! - [`error`] - timeout, fatal, cancelled and validation errors

#![deny(missing_docs)]

pub mod barrier;
pub mod error;
pub mod observer;
pub mod poll;
pub mod report;
pub mod state;

pub use barrier::{await_all, await_all_with, BarrierResult, SubTarget};
pub use error::ConvergeError;
pub use observer::{observe, observe_absence, Observer, Snapshot};
pub use poll::{poll, poll_with, Attempt, PollContext, PollOutcome, PollResult, PollSpec};
pub use report::{AttemptReporter, RecordingReporter, TracingReporter};
pub use state::{ObserverState, Outcome};
