//! Wait for an installed NFD operator and check it has annotated a worker

use clap::Args;
use converge_core::observer::{LabelPresent, PhaseReached};
use converge_core::{Observer, ObserverState};
use converge_kube::resource::{CLUSTER_SERVICE_VERSION, NAMESPACE, NODE};
use converge_kube::wait::{wait_for_object, ObjectRef};
use tracing::info;

use super::deploy_nfd::NFD_PACKAGE;
use super::{budget, find_operator_csv, name_of, str_at, StepContext};
use crate::{Error, Result};

/// Annotation NFD writes on every node it has labelled
pub const NFD_FEATURE_LABELS_ANNOTATION: &str = "nfd.node.kubernetes.io/feature-labels";

/// Label selecting worker nodes
pub const WORKER_ROLE_LABEL: &str = "node-role.kubernetes.io/worker";

const CSV_ATTEMPTS: u32 = 15;
const CSV_INTERVAL_SECS: u64 = 30;

/// Wait for the NFD operator
#[derive(Args, Debug, Clone)]
pub struct WaitNfdArgs {
    /// Substring identifying the NFD CSV
    #[arg(long, default_value = NFD_PACKAGE)]
    pub package: String,
}

impl Default for WaitNfdArgs {
    fn default() -> Self {
        Self {
            package: NFD_PACKAGE.to_string(),
        }
    }
}

/// Run the NFD wait step
pub async fn run(ctx: &StepContext, args: &WaitNfdArgs) -> Result<()> {
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
    info!(namespace = %namespace, "NFD operator installed");
    ctx.record_json("nfd_operator_csv.json", &csv).await?;

    let workers = ctx.client().list(&NODE, "", WORKER_ROLE_LABEL).await?;
    let node = workers
        .first()
        .ok_or_else(|| Error::step_failed("NFD node check", "no worker nodes"))?;
    let annotated = LabelPresent::annotation_key(NFD_FEATURE_LABELS_ANNOTATION);
    if annotated.classify(node) != ObserverState::Converged {
        return Err(Error::step_failed(
            "NFD node check",
            format!(
                "node {} has no {} annotation",
                name_of(node).unwrap_or_default(),
                NFD_FEATURE_LABELS_ANNOTATION
            ),
        ));
    }
    ctx.record_json("first_worker_node.json", node).await?;

    let ns = ctx.client().get(&NAMESPACE, "", &namespace).await?;
    ctx.record_json("namespace.json", &ns).await
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use converge_core::Snapshot;
    use serde_json::json;

    fn csv(phase: &str) -> Snapshot {
        json!({
            "metadata": {"name": "nfd.4.14.0-202310201027", "namespace": "openshift-nfd"},
            "status": {"phase": phase}
        })
    }

    fn cluster(worker: Snapshot) -> MockClient {
        let mut client = MockClient::new();
        client
            .expect_list()
            .withf(|kind, _, _| *kind == CLUSTER_SERVICE_VERSION)
            .returning(|_, _, _| {
                Ok(vec![
                    json!({"metadata": {"name": "gpu-operator-certified.v23.9.0", "namespace": "nvidia-gpu-operator"}}),
                    csv("Installing"),
                ])
            });
        let mut seq = mockall::Sequence::new();
        client
            .expect_get()
            .withf(|kind, ns, _| *kind == CLUSTER_SERVICE_VERSION && ns == "openshift-nfd")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(csv("Installing")));
        client
            .expect_get()
            .withf(|kind, _, _| *kind == CLUSTER_SERVICE_VERSION)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(csv("Succeeded")));
        client
            .expect_list()
            .withf(|kind, _, label| *kind == NODE && label == WORKER_ROLE_LABEL)
            .returning(move |_, _, _| Ok(vec![worker.clone()]));
        client
    }

    #[tokio::test(start_paused = true)]
    async fn annotated_worker_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = cluster(json!({
            "metadata": {
                "name": "ip-10-0-1-1",
                "annotations": {NFD_FEATURE_LABELS_ANNOTATION: "cpu-cpuid.AESNI,kernel-version.full"}
            }
        }));
        client
            .expect_get()
            .withf(|kind, _, name| *kind == NAMESPACE && name == "openshift-nfd")
            .times(1)
            .returning(|_, _, _| Ok(json!({"metadata": {"name": "openshift-nfd"}})));

        let ctx = context(client, tmp.path());
        let start = tokio::time::Instant::now();
        run(&ctx, &WaitNfdArgs::default()).await.unwrap();

        assert_eq!(start.elapsed(), std::time::Duration::from_secs(30));
        assert!(artifact(tmp.path(), "nfd_operator_csv.json").contains("Succeeded"));
        assert!(artifact(tmp.path(), "first_worker_node.json").contains("ip-10-0-1-1"));
        assert!(artifact(tmp.path(), "namespace.json").contains("openshift-nfd"));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_without_annotation_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let client = cluster(json!({"metadata": {"name": "ip-10-0-1-1", "annotations": {}}}));

        let ctx = context(client, tmp.path());
        let err = run(&ctx, &WaitNfdArgs::default()).await.unwrap_err();
        assert!(err.to_string().contains("node ip-10-0-1-1 has no nfd.node.kubernetes.io/feature-labels annotation"));
        assert!(!tmp.path().join("first_worker_node.json").exists());
    }
}
