//! Pattern-in-log observer

use super::Observer;
use crate::state::ObserverState;

/// Converged when accumulated text contains every required substring.
///
/// The text is the full output re-fetched on each attempt, not a diff.
/// Matching is plain substring containment. A log never signals a terminal
/// failure, so this observer is never `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternInLog {
    required: Vec<String>,
}

impl PatternInLog {
    /// Require all of `patterns`
    pub fn all<I, P>(patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            required: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Required substrings not found in `text`
    pub fn missing(&self, text: &str) -> Vec<&str> {
        let text = normalize(text);
        self.required
            .iter()
            .filter(|p| !text.contains(p.as_str()))
            .map(String::as_str)
            .collect()
    }
}

/// Progress bars redraw with `\r`; split them into lines like a terminal would
fn normalize(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains('\r') {
        std::borrow::Cow::Owned(text.replace('\r', "\n"))
    } else {
        std::borrow::Cow::Borrowed(text)
    }
}

impl Observer<str> for PatternInLog {
    fn classify(&self, text: &str) -> ObserverState {
        if self.missing(text).is_empty() {
            ObserverState::Converged
        } else {
            ObserverState::Pending
        }
    }
}

impl Observer<String> for PatternInLog {
    fn classify(&self, text: &String) -> ObserverState {
        Observer::<str>::classify(self, text.as_str())
    }
}
