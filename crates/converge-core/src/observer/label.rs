//! Label/annotation-present observer

use super::{Observer, Snapshot};
use crate::state::ObserverState;

/// Which metadata map to inspect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    /// `metadata.labels`
    Labels,
    /// `metadata.annotations`
    Annotations,
}

impl MetadataField {
    fn pointer(self) -> &'static str {
        match self {
            MetadataField::Labels => "/metadata/labels",
            MetadataField::Annotations => "/metadata/annotations",
        }
    }
}

/// Converged when a metadata key is present, optionally with a given value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPresent {
    field: MetadataField,
    key: String,
    value: Option<String>,
}

impl LabelPresent {
    /// Label `key` with exactly `value`
    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: MetadataField::Labels,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Label `key` with any value
    pub fn label_key(key: impl Into<String>) -> Self {
        Self {
            field: MetadataField::Labels,
            key: key.into(),
            value: None,
        }
    }

    /// Annotation `key` with exactly `value`
    pub fn annotation(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: MetadataField::Annotations,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Annotation `key` with any value
    pub fn annotation_key(key: impl Into<String>) -> Self {
        Self {
            field: MetadataField::Annotations,
            key: key.into(),
            value: None,
        }
    }

    /// Current value of the key in `snapshot`
    pub fn value<'a>(&self, snapshot: &'a Snapshot) -> Option<&'a str> {
        snapshot
            .pointer(self.field.pointer())
            .and_then(|m| m.get(&self.key))
            .and_then(|v| v.as_str())
    }
}

impl Observer<Snapshot> for LabelPresent {
    fn classify(&self, snapshot: &Snapshot) -> ObserverState {
        match (self.value(snapshot), &self.value) {
            (Some(actual), Some(expected)) if actual == expected => ObserverState::Converged,
            (Some(_), None) => ObserverState::Converged,
            _ => ObserverState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MONITORING: &str = "openshift.io/cluster-monitoring";

    #[test]
    fn label_with_value() {
        let observer = LabelPresent::label(MONITORING, "true");
        let labelled = json!({"metadata": {"labels": {MONITORING: "true"}}});
        let wrong = json!({"metadata": {"labels": {MONITORING: "false"}}});
        let bare = json!({"metadata": {"name": "gpu"}});
        assert_eq!(observer.classify(&labelled), ObserverState::Converged);
        assert_eq!(observer.classify(&wrong), ObserverState::Pending);
        assert_eq!(observer.classify(&bare), ObserverState::Pending);
    }

    #[test]
    fn presence_only_accepts_any_value() {
        let observer = LabelPresent::label_key("feature.node.kubernetes.io/pci-10de.present");
        let node = json!({"metadata": {"labels": {"feature.node.kubernetes.io/pci-10de.present": "true"}}});
        assert_eq!(observer.classify(&node), ObserverState::Converged);
    }

    #[test]
    fn annotations_are_separate_from_labels() {
        let observer = LabelPresent::annotation_key("alm-examples");
        let labelled = json!({"metadata": {"labels": {"alm-examples": "[]"}}});
        let annotated = json!({"metadata": {"annotations": {"alm-examples": "[]"}}});
        assert_eq!(observer.classify(&labelled), ObserverState::Pending);
        assert_eq!(observer.classify(&annotated), ObserverState::Converged);
        assert_eq!(
            LabelPresent::annotation("alm-examples", "[]").value(&annotated),
            Some("[]")
        );
    }
}
