//! CLI commands
//!
//! Each subcommand is one CI step. Steps share a [`StepContext`] carrying the
//! driver configuration, the resource client, the artifact recorder and the
//! poll context used for every wait.

use std::sync::Arc;
use std::time::Duration;

use converge_core::{PollContext, PollSpec, Snapshot};
use converge_kube::resource::{CLUSTER_SERVICE_VERSION, NAMESPACE, OPERATOR_GROUP};
use converge_kube::{ensure_created, ArtifactRecorder, DriverConfig, ResourceClient};
use serde_json::json;
use tracing::info;

use crate::{Error, Result};

pub mod addon_must_gather;
pub mod check_connection;
pub mod deploy_nfd;
pub mod deploy_operator;
pub mod gpu_burn;
pub mod install_addon;
pub mod operator_metrics;
pub mod scale_gpu_nodes;
pub mod wait_nfd;
pub mod wait_operator;

/// OLM package name of the NVIDIA GPU operator
pub const GPU_OPERATOR_PACKAGE: &str = "gpu-operator-certified";

/// Annotation holding example custom resources for an operator's CRDs
pub const ALM_EXAMPLES_ANNOTATION: &str = "alm-examples";

/// Everything a step needs to talk to the cluster
#[derive(Clone)]
pub struct StepContext {
    /// Driver settings
    pub config: DriverConfig,
    client: Arc<dyn ResourceClient>,
    recorder: Arc<dyn ArtifactRecorder>,
    poll: PollContext,
}

impl StepContext {
    /// Context with the default poll context
    pub fn new(
        config: DriverConfig,
        client: Arc<dyn ResourceClient>,
        recorder: Arc<dyn ArtifactRecorder>,
    ) -> Self {
        Self {
            config,
            client,
            recorder,
            poll: PollContext::default(),
        }
    }

    /// Use `poll` for every wait
    pub fn with_poll_context(mut self, poll: PollContext) -> Self {
        self.poll = poll;
        self
    }

    /// The resource client
    pub fn client(&self) -> &dyn ResourceClient {
        self.client.as_ref()
    }

    /// The artifact recorder
    pub fn recorder(&self) -> &dyn ArtifactRecorder {
        self.recorder.as_ref()
    }

    /// The poll context
    pub fn poll(&self) -> &PollContext {
        &self.poll
    }

    /// Record a JSON artifact, failing the step if it cannot be written
    pub async fn record_json(&self, name: &str, value: &Snapshot) -> Result<()> {
        self.recorder.record_json(name, value).await?;
        Ok(())
    }

    /// Record a text artifact, failing the step if it cannot be written
    pub async fn record_text(&self, name: &str, text: &str) -> Result<()> {
        self.recorder.record_text(name, text).await?;
        Ok(())
    }
}

/// Attempt budget for one wait
pub fn budget(label: &str, attempts: u32, interval_secs: u64) -> Result<PollSpec> {
    Ok(PollSpec::new(
        label,
        attempts,
        Duration::from_secs(interval_secs),
    )?)
}

/// Read a string field by JSON pointer
pub(crate) fn str_at<'a>(value: &'a Snapshot, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(|v| v.as_str())
}

/// Name of a resource snapshot
pub(crate) fn name_of(value: &Snapshot) -> Option<&str> {
    str_at(value, "/metadata/name")
}

/// Find the operator's ClusterServiceVersion in any namespace
///
/// Matches the first CSV whose name contains `package`.
pub async fn find_operator_csv(ctx: &StepContext, package: &str) -> Result<Snapshot> {
    let csvs = ctx.client().list(&CLUSTER_SERVICE_VERSION, "", "").await?;
    let csv = csvs
        .into_iter()
        .find(|csv| name_of(csv).is_some_and(|name| name.contains(package)))
        .ok_or_else(|| converge_kube::Error::not_found("ClusterServiceVersion", package))?;

    info!(
        name = name_of(&csv).unwrap_or_default(),
        namespace = str_at(&csv, "/metadata/namespace").unwrap_or_default(),
        version = str_at(&csv, "/spec/version").unwrap_or_default(),
        "Found operator CSV"
    );
    Ok(csv)
}

/// Record a CSV and its version file
pub async fn record_csv(ctx: &StepContext, csv: &Snapshot) -> Result<()> {
    ctx.record_json("gpu_operator_csv.json", csv).await?;
    let version = str_at(csv, "/spec/version")
        .ok_or_else(|| Error::step_failed("record CSV", "CSV has no spec.version"))?;
    ctx.record_text("gpu_operator_version.txt", version).await
}

/// Create `namespace` unless it already exists
pub async fn ensure_namespace(ctx: &StepContext, namespace: &str) -> Result<Snapshot> {
    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": namespace}
    });
    Ok(ensure_created(ctx.client(), &NAMESPACE, "", &manifest).await?)
}

/// Create an OperatorGroup targeting `namespace` unless one is already there
pub async fn ensure_operator_group(ctx: &StepContext, namespace: &str) -> Result<()> {
    let groups = ctx.client().list(&OPERATOR_GROUP, namespace, "").await?;
    if !groups.is_empty() {
        return Ok(());
    }
    let group = json!({
        "apiVersion": OPERATOR_GROUP.api_version,
        "kind": OPERATOR_GROUP.kind,
        "metadata": {"name": format!("{}-group", namespace), "namespace": namespace},
        "spec": {"targetNamespaces": [namespace]}
    });
    ctx.client()
        .create(&OPERATOR_GROUP, namespace, &group)
        .await?;
    Ok(())
}

/// First example resource from a CSV's `alm-examples` annotation
pub fn first_alm_example(csv: &Snapshot) -> Result<Snapshot> {
    let raw = csv
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(ALM_EXAMPLES_ANNOTATION))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::step_failed(
                "alm-examples",
                format!("{} not found in CSV", ALM_EXAMPLES_ANNOTATION),
            )
        })?;
    let examples: Vec<Snapshot> = serde_json::from_str(raw)?;
    examples
        .into_iter()
        .next()
        .ok_or_else(|| Error::step_failed("alm-examples", "alm-examples is empty"))
}
