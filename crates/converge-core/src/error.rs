//! Error types for convergence runs
//!
//! A poll or barrier that gives up always says why: the budget ran out
//! (`Timeout`), the target can never converge (`Fatal`), or the caller
//! stopped waiting (`Cancelled`). Callers report these differently, so they
//! are never folded into one variant.

use thiserror::Error;

/// Errors produced by the poller and barrier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvergeError {
    /// Invalid configuration, rejected before any attempt is made
    #[error("invalid configuration ({field}): {message}")]
    Validation {
        /// Name of the offending setting (e.g. "max_attempts")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// Attempt budget exhausted without convergence or a fatal signal
    #[error("{label}: timed out after {attempts} attempts{}", format_pending(.pending))]
    Timeout {
        /// Label of the poll run
        label: String,
        /// Attempts (or barrier rounds) consumed
        attempts: u32,
        /// Sub-targets that never converged (empty for a single poll)
        pending: Vec<String>,
    },

    /// The target entered a state it can never leave on its own
    #[error("{label}: fatal condition after {attempts} attempts: {reason}")]
    Fatal {
        /// Label of the poll run
        label: String,
        /// Attempts consumed before the fatal observation
        attempts: u32,
        /// What was observed
        reason: String,
    },

    /// The run was cancelled between attempts
    #[error("{label}: cancelled after {attempts} attempts")]
    Cancelled {
        /// Label of the poll run
        label: String,
        /// Attempts consumed before cancellation
        attempts: u32,
    },
}

fn format_pending(pending: &[String]) -> String {
    if pending.is_empty() {
        String::new()
    } else {
        format!(" (pending: {})", pending.join(", "))
    }
}

impl ConvergeError {
    /// Create a validation error for the named field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether running the same poll again could plausibly succeed
    ///
    /// Timeouts and cancellations may; fatal observations and bad
    /// configuration will not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConvergeError::Validation { .. } => false,
            ConvergeError::Timeout { .. } => true,
            ConvergeError::Fatal { .. } => false,
            ConvergeError::Cancelled { .. } => true,
        }
    }

    /// Label of the poll run this error belongs to, if any
    pub fn label(&self) -> Option<&str> {
        match self {
            ConvergeError::Validation { .. } => None,
            ConvergeError::Timeout { label, .. }
            | ConvergeError::Fatal { label, .. }
            | ConvergeError::Cancelled { label, .. } => Some(label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_lists_pending_targets() {
        let err = ConvergeError::Timeout {
            label: "gpu-burn logs".to_string(),
            attempts: 5,
            pending: vec!["pod-a".to_string(), "pod-b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out after 5 attempts"));
        assert!(msg.contains("pending: pod-a, pod-b"));
        assert!(err.is_retryable());
        assert_eq!(err.label(), Some("gpu-burn logs"));
    }

    #[test]
    fn timeout_without_targets_has_no_pending_suffix() {
        let err = ConvergeError::Timeout {
            label: "csv phase".to_string(),
            attempts: 3,
            pending: vec![],
        };
        assert_eq!(err.to_string(), "csv phase: timed out after 3 attempts");
    }

    #[test]
    fn fatal_and_validation_are_not_retryable() {
        let fatal = ConvergeError::Fatal {
            label: "addon".to_string(),
            attempts: 2,
            reason: "state is failed".to_string(),
        };
        assert!(!fatal.is_retryable());
        assert!(fatal.to_string().contains("state is failed"));

        let invalid = ConvergeError::validation("max_attempts", "must be at least 1");
        assert!(!invalid.is_retryable());
        assert_eq!(invalid.label(), None);
        assert!(invalid.to_string().contains("max_attempts"));
    }
}
