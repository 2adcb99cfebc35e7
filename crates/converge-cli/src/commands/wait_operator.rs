//! Wait for an installed GPU operator to become fully operational

use clap::Args;
use converge_core::observer::{CountMatches, PhaseReached};
use converge_core::{observe, poll_with, ObserverState, Outcome, Snapshot};
use converge_kube::resource::{CLUSTER_POLICY, CLUSTER_SERVICE_VERSION, DAEMON_SET, NODE};
use converge_kube::wait::{wait_for_object, ObjectRef};
use tokio::sync::Mutex;
use tracing::info;

use super::{budget, find_operator_csv, name_of, record_csv, str_at, StepContext, GPU_OPERATOR_PACKAGE};
use crate::{Error, Result};

/// Node labels set by node feature discovery on hosts with an NVIDIA PCI device
pub const GPU_NODE_LABELS: [&str; 3] = [
    "feature.node.kubernetes.io/pci-10de.present",
    "feature.node.kubernetes.io/pci-0302_10de.present",
    "feature.node.kubernetes.io/pci-0300_10de.present",
];

/// DaemonSet that validates the operator's node stack
pub const VALIDATOR_DAEMONSET: &str = "nvidia-operator-validator";

const CSV_ATTEMPTS: u32 = 15;
const CSV_INTERVAL_SECS: u64 = 30;
const NODES_ATTEMPTS: u32 = 15;
const NODES_INTERVAL_SECS: u64 = 30;
const VALIDATOR_ATTEMPTS: u32 = 20;
const VALIDATOR_INTERVAL_SECS: u64 = 30;

/// Wait for the GPU operator, GPU nodes and the validator
#[derive(Args, Debug, Clone)]
pub struct WaitOperatorArgs {
    /// Substring identifying the operator CSV
    #[arg(long, default_value = GPU_OPERATOR_PACKAGE)]
    pub package: String,
}

impl Default for WaitOperatorArgs {
    fn default() -> Self {
        Self {
            package: GPU_OPERATOR_PACKAGE.to_string(),
        }
    }
}

/// Run the wait step
pub async fn run(ctx: &StepContext, args: &WaitOperatorArgs) -> Result<()> {
    let csv = find_operator_csv(ctx, &args.package).await?;
    let namespace = str_at(&csv, "/metadata/namespace")
        .ok_or_else(|| Error::step_failed("find CSV", "CSV has no namespace"))?
        .to_string();
    let name = name_of(&csv).unwrap_or_default().to_string();

    let spec = budget("Wait for CSV to be Succeeded", CSV_ATTEMPTS, CSV_INTERVAL_SECS)?;
    let csv = wait_for_object(
        ctx.client(),
        &spec,
        ctx.poll(),
        &ObjectRef::new(CLUSTER_SERVICE_VERSION, &namespace, &name),
        &PhaseReached::new("Succeeded").failing_on("Failed"),
    )
    .await?;
    record_csv(ctx, &csv).await?;

    let nodes = wait_for_gpu_nodes(ctx).await?;
    info!(count = nodes.len(), "Found GPU nodes");
    ctx.record_json("gpu_nodes_found.json", &Snapshot::Array(nodes))
        .await?;

    let policies = ctx.client().list(&CLUSTER_POLICY, "", "").await?;
    let policy = match policies.as_slice() {
        [only] => only,
        _ => {
            return Err(Error::step_failed(
                "ClusterPolicy check",
                format!("expected 1 ClusterPolicy, found {}", policies.len()),
            ))
        }
    };
    info!(name = name_of(policy).unwrap_or_default(), "ClusterPolicy found");
    ctx.record_json("clusterpolicy.json", policy).await?;

    let spec = budget(
        "Wait for nvidia-operator-validator daemonset",
        VALIDATOR_ATTEMPTS,
        VALIDATOR_INTERVAL_SECS,
    )?;
    let validator = wait_for_object(
        ctx.client(),
        &spec,
        ctx.poll(),
        &ObjectRef::new(DAEMON_SET, &namespace, VALIDATOR_DAEMONSET),
        &CountMatches::daemonset(),
    )
    .await?;
    ctx.record_json("nvidia-operator-validator-ds.json", &validator)
        .await
}

/// Wait until any of the GPU node labels selects at least one node
///
/// Labels are tried in order within one attempt; the first that selects
/// nodes wins.
async fn wait_for_gpu_nodes(ctx: &StepContext) -> Result<Vec<Snapshot>> {
    let spec = budget("Wait For GPU Nodes", NODES_ATTEMPTS, NODES_INTERVAL_SECS)?;
    let found: Mutex<Vec<Snapshot>> = Mutex::new(Vec::new());
    let non_empty = |nodes: &Vec<Snapshot>| {
        if nodes.is_empty() {
            ObserverState::Pending
        } else {
            ObserverState::Converged
        }
    };

    let result = poll_with(&spec, ctx.poll(), || async {
        for label in GPU_NODE_LABELS {
            let fetched = ctx.client().list(&NODE, "", label).await;
            if let Ok(nodes) = &fetched {
                if !nodes.is_empty() {
                    *found.lock().await = nodes.clone();
                }
            }
            let outcome = observe(fetched, &non_empty);
            if outcome != Outcome::Pending {
                return outcome;
            }
        }
        Outcome::Pending
    })
    .await;

    result.into_result()?;
    Ok(found.into_inner())
}
