//! Resource kinds the driver reads and writes
//!
//! Every kind is addressed dynamically through `Api<DynamicObject>`, so the
//! driver needs only its apiVersion, kind, and scope. Plurals follow a lookup
//! table for the irregular kinds and a simple rule for the rest.

use kube::discovery::ApiResource;

/// apiVersion, kind and scope of a Kubernetes resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    /// Full API version (e.g. "apps/v1", "v1")
    pub api_version: &'static str,
    /// Resource kind (e.g. "DaemonSet")
    pub kind: &'static str,
    /// Whether the resource lives in a namespace
    pub namespaced: bool,
}

impl ResourceKind {
    /// Build the `ApiResource` for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(self.api_version, self.kind)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind)
    }
}

/// Core Namespace
pub const NAMESPACE: ResourceKind = ResourceKind {
    api_version: "v1",
    kind: "Namespace",
    namespaced: false,
};

/// Core Node
pub const NODE: ResourceKind = ResourceKind {
    api_version: "v1",
    kind: "Node",
    namespaced: false,
};

/// Core Pod
pub const POD: ResourceKind = ResourceKind {
    api_version: "v1",
    kind: "Pod",
    namespaced: true,
};

/// Core Secret
pub const SECRET: ResourceKind = ResourceKind {
    api_version: "v1",
    kind: "Secret",
    namespaced: true,
};

/// Core ConfigMap
pub const CONFIG_MAP: ResourceKind = ResourceKind {
    api_version: "v1",
    kind: "ConfigMap",
    namespaced: true,
};

/// apps/v1 DaemonSet
pub const DAEMON_SET: ResourceKind = ResourceKind {
    api_version: "apps/v1",
    kind: "DaemonSet",
    namespaced: true,
};

/// OpenShift machine API MachineSet
pub const MACHINE_SET: ResourceKind = ResourceKind {
    api_version: "machine.openshift.io/v1beta1",
    kind: "MachineSet",
    namespaced: true,
};

/// OLM CatalogSource
pub const CATALOG_SOURCE: ResourceKind = ResourceKind {
    api_version: "operators.coreos.com/v1alpha1",
    kind: "CatalogSource",
    namespaced: true,
};

/// OLM PackageManifest (served by the package server)
pub const PACKAGE_MANIFEST: ResourceKind = ResourceKind {
    api_version: "packages.operators.coreos.com/v1",
    kind: "PackageManifest",
    namespaced: true,
};

/// OLM OperatorGroup
pub const OPERATOR_GROUP: ResourceKind = ResourceKind {
    api_version: "operators.coreos.com/v1",
    kind: "OperatorGroup",
    namespaced: true,
};

/// OLM Subscription
pub const SUBSCRIPTION: ResourceKind = ResourceKind {
    api_version: "operators.coreos.com/v1alpha1",
    kind: "Subscription",
    namespaced: true,
};

/// OLM ClusterServiceVersion
pub const CLUSTER_SERVICE_VERSION: ResourceKind = ResourceKind {
    api_version: "operators.coreos.com/v1alpha1",
    kind: "ClusterServiceVersion",
    namespaced: true,
};

/// NVIDIA GPU operator ClusterPolicy
pub const CLUSTER_POLICY: ResourceKind = ResourceKind {
    api_version: "nvidia.com/v1",
    kind: "ClusterPolicy",
    namespaced: false,
};

/// Node Feature Discovery operator instance
pub const NODE_FEATURE_DISCOVERY: ResourceKind = ResourceKind {
    api_version: "nfd.openshift.io/v1",
    kind: "NodeFeatureDiscovery",
    namespaced: true,
};

/// OpenShift ClusterVersion (a singleton named "version")
pub const CLUSTER_VERSION: ResourceKind = ResourceKind {
    api_version: "config.openshift.io/v1",
    kind: "ClusterVersion",
    namespaced: false,
};

/// Build an ApiResource from a known apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// ```
/// use converge_kube::resource::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Irregular plurals (lowercase singular -> plural)
const KIND_PLURALS: &[(&str, &str)] = &[
    ("clusterpolicy", "clusterpolicies"),
    ("packagemanifest", "packagemanifests"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(s, _)| *s == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plurals_for_driver_kinds() {
        assert_eq!(pluralize_kind("DaemonSet"), "daemonsets");
        assert_eq!(pluralize_kind("MachineSet"), "machinesets");
        assert_eq!(pluralize_kind("ClusterPolicy"), "clusterpolicies");
        assert_eq!(pluralize_kind("ClusterServiceVersion"), "clusterserviceversions");
        assert_eq!(pluralize_kind("Namespace"), "namespaces");
        assert_eq!(pluralize_kind("ConfigMap"), "configmaps");
        assert_eq!(pluralize_kind("NodeFeatureDiscovery"), "nodefeaturediscoveries");
        assert_eq!(pluralize_kind("ClusterVersion"), "clusterversions");
    }

    #[test]
    fn api_resource_splits_group_and_version() {
        let ar = MACHINE_SET.api_resource();
        assert_eq!(ar.group, "machine.openshift.io");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.plural, "machinesets");

        let ar = POD.api_resource();
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.api_version, "v1");
    }
}
