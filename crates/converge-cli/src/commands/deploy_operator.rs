//! Deploy the GPU operator from the certified catalog
//!
//! 1. Check the catalog source is connected
//! 2. Resolve the subscription channel from the PackageManifest
//! 3. Ensure the namespace and an OperatorGroup exist
//! 4. Subscribe and wait for the CSV to succeed
//! 5. Create the first ClusterPolicy example shipped with the CSV

use clap::Args;
use converge_core::observer::PhaseReached;
use converge_core::{Observer, ObserverState, Snapshot};
use converge_kube::resource::{
    CATALOG_SOURCE, CLUSTER_POLICY, CLUSTER_SERVICE_VERSION, PACKAGE_MANIFEST, SUBSCRIPTION,
};
use converge_kube::wait::wait_for_single;
use serde_json::json;
use tracing::info;

use super::{
    budget, ensure_namespace, ensure_operator_group, first_alm_example, name_of, record_csv,
    str_at, StepContext, GPU_OPERATOR_PACKAGE,
};
use crate::{Error, Result};

const CSV_ATTEMPTS: u32 = 40;
const CSV_INTERVAL_SECS: u64 = 30;

/// Deploy the GPU operator through OLM
#[derive(Args, Debug, Clone)]
pub struct DeployOperatorArgs {
    /// CatalogSource providing the operator package
    #[arg(long, default_value = "certified-operators")]
    pub catalog_source: String,

    /// Namespace of the CatalogSource
    #[arg(long, default_value = "openshift-marketplace")]
    pub catalog_namespace: String,

    /// OLM package name
    #[arg(long, default_value = GPU_OPERATOR_PACKAGE)]
    pub package: String,

    /// Name of the Subscription to create
    #[arg(long, default_value = "gpu-operator-test-sub")]
    pub subscription: String,
}

impl Default for DeployOperatorArgs {
    fn default() -> Self {
        Self {
            catalog_source: "certified-operators".to_string(),
            catalog_namespace: "openshift-marketplace".to_string(),
            package: GPU_OPERATOR_PACKAGE.to_string(),
            subscription: "gpu-operator-test-sub".to_string(),
        }
    }
}

/// Run the deploy step
pub async fn run(ctx: &StepContext, args: &DeployOperatorArgs) -> Result<()> {
    let namespace = ctx.config.namespace.clone();

    check_catalog_ready(ctx, args).await?;
    let channel = resolve_channel(ctx, args).await?;
    info!(package = %args.package, channel = %channel, "Resolved operator channel");

    ensure_namespace(ctx, &namespace).await?;
    ensure_operator_group(ctx, &namespace).await?;

    let subscription = ctx
        .client()
        .create(
            &SUBSCRIPTION,
            &namespace,
            &subscription_manifest(args, &namespace, &channel),
        )
        .await?;
    ctx.record_json("gpu_operator_subscription.json", &subscription)
        .await?;

    let selector = format!("operators.coreos.com/{}.{}", args.package, namespace);
    let spec = budget(
        &format!("Wait for CSV with label '{}' to become 'Succeeded'", selector),
        CSV_ATTEMPTS,
        CSV_INTERVAL_SECS,
    )?;
    let csv = wait_for_single(
        ctx.client(),
        &spec,
        ctx.poll(),
        &CLUSTER_SERVICE_VERSION,
        &namespace,
        &selector,
        &PhaseReached::new("Succeeded").failing_on("Failed"),
    )
    .await?;
    record_csv(ctx, &csv).await?;

    let mut policy = first_alm_example(&csv)?;
    policy["metadata"]["namespace"] = json!(namespace);
    let created = ctx
        .client()
        .create(&CLUSTER_POLICY, &namespace, &policy)
        .await?;
    info!(name = name_of(&created).unwrap_or_default(), "Created ClusterPolicy");
    ctx.record_json("gpu_cr_cluster_policy.json", &created)
        .await
}

async fn check_catalog_ready(ctx: &StepContext, args: &DeployOperatorArgs) -> Result<()> {
    let catalog = ctx
        .client()
        .get(&CATALOG_SOURCE, &args.catalog_namespace, &args.catalog_source)
        .await?;
    let ready = PhaseReached::new("READY").at("/status/connectionState/lastObservedState");
    if ready.classify(&catalog) != ObserverState::Converged {
        return Err(Error::step_failed(
            "catalog check",
            format!(
                "{} state is {}",
                args.catalog_source,
                ready.phase(&catalog).unwrap_or("unknown")
            ),
        ));
    }
    Ok(())
}

async fn resolve_channel(ctx: &StepContext, args: &DeployOperatorArgs) -> Result<String> {
    let manifest = ctx
        .client()
        .get(&PACKAGE_MANIFEST, &args.catalog_namespace, &args.package)
        .await?;
    ctx.record_json("gpu_operator_packagemanifest.json", &manifest)
        .await?;
    select_channel(&manifest, ctx.config.operator_channel.as_deref())
}

/// Pick the requested channel, or the first one the package lists
pub fn select_channel(manifest: &Snapshot, requested: Option<&str>) -> Result<String> {
    let channels: Vec<&str> = manifest
        .pointer("/status/channels")
        .and_then(|c| c.as_array())
        .map(|channels| channels.iter().filter_map(|c| str_at(c, "/name")).collect())
        .unwrap_or_default();

    let channel = match requested {
        Some(channel) => channel,
        None => channels
            .first()
            .copied()
            .ok_or_else(|| Error::step_failed("channel lookup", "package lists no channels"))?,
    };

    if !channels.contains(&channel) {
        return Err(Error::step_failed(
            "channel lookup",
            format!("channel {} not in [{}]", channel, channels.join(", ")),
        ));
    }
    Ok(channel.to_string())
}

fn subscription_manifest(args: &DeployOperatorArgs, namespace: &str, channel: &str) -> Snapshot {
    json!({
        "apiVersion": SUBSCRIPTION.api_version,
        "kind": SUBSCRIPTION.kind,
        "metadata": {"name": args.subscription, "namespace": namespace},
        "spec": {
            "channel": channel,
            "installPlanApproval": "Automatic",
            "name": args.package,
            "source": args.catalog_source,
            "sourceNamespace": args.catalog_namespace
        }
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use converge_kube::resource::{NAMESPACE, OPERATOR_GROUP};

    fn csv(phase: &str) -> Snapshot {
        json!({
            "metadata": {
                "name": "gpu-operator-certified.v23.9.0",
                "namespace": "nvidia-gpu-operator",
                "annotations": {
                    "alm-examples": r#"[{"apiVersion":"nvidia.com/v1","kind":"ClusterPolicy","metadata":{"name":"gpu-cluster-policy"},"spec":{}}]"#
                }
            },
            "spec": {"version": "23.9.0"},
            "status": {"phase": phase}
        })
    }

    #[test]
    fn channel_defaults_to_first_listed() {
        let manifest = json!({"status": {"channels": [{"name": "v23.9"}, {"name": "stable"}]}});
        assert_eq!(select_channel(&manifest, None).unwrap(), "v23.9");
        assert_eq!(select_channel(&manifest, Some("stable")).unwrap(), "stable");
        let err = select_channel(&manifest, Some("v1.10")).unwrap_err();
        assert!(err.to_string().contains("channel v1.10 not in [v23.9, stable]"));
    }

    #[test]
    fn alm_examples_first_item() {
        let policy = first_alm_example(&csv("Succeeded")).unwrap();
        assert_eq!(policy["kind"], "ClusterPolicy");
        assert!(first_alm_example(&json!({"metadata": {}})).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deploys_operator_and_cluster_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockClient::new();

        client
            .expect_get()
            .withf(|kind, _, _| *kind == CATALOG_SOURCE)
            .returning(|_, _, _| {
                Ok(json!({"status": {"connectionState": {"lastObservedState": "READY"}}}))
            });
        client
            .expect_get()
            .withf(|kind, _, _| *kind == PACKAGE_MANIFEST)
            .returning(|_, _, _| Ok(json!({"status": {"channels": [{"name": "v23.9"}]}})));
        client
            .expect_create()
            .withf(|kind, _, _| *kind == NAMESPACE)
            .returning(|_, _, obj| Ok(obj.clone()));
        client
            .expect_list()
            .withf(|kind, _, _| *kind == OPERATOR_GROUP)
            .returning(|_, _, _| Ok(vec![]));
        client
            .expect_create()
            .withf(|kind, _, obj| *kind == OPERATOR_GROUP && obj["spec"]["targetNamespaces"][0] == "nvidia-gpu-operator")
            .times(1)
            .returning(|_, _, obj| Ok(obj.clone()));
        client
            .expect_create()
            .withf(|kind, _, obj| *kind == SUBSCRIPTION && obj["spec"]["channel"] == "v23.9")
            .times(1)
            .returning(|_, _, obj| Ok(obj.clone()));

        let mut seq = mockall::Sequence::new();
        client
            .expect_list()
            .withf(|kind, _, selector| {
                *kind == CLUSTER_SERVICE_VERSION
                    && selector == "operators.coreos.com/gpu-operator-certified.nvidia-gpu-operator"
            })
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(vec![csv("Installing")]));
        client
            .expect_list()
            .withf(|kind, _, _| *kind == CLUSTER_SERVICE_VERSION)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(vec![csv("Succeeded")]));

        client
            .expect_create()
            .withf(|kind, ns, obj| {
                *kind == CLUSTER_POLICY
                    && ns == "nvidia-gpu-operator"
                    && obj["metadata"]["namespace"] == "nvidia-gpu-operator"
            })
            .times(1)
            .returning(|_, _, obj| Ok(obj.clone()));

        let ctx = context(client, tmp.path());
        run(&ctx, &DeployOperatorArgs::default()).await.unwrap();

        assert_eq!(artifact(tmp.path(), "gpu_operator_version.txt"), "23.9.0");
        assert!(artifact(tmp.path(), "gpu_cr_cluster_policy.json").contains("gpu-cluster-policy"));
        assert!(artifact(tmp.path(), "gpu_operator_subscription.json").contains("v23.9"));
    }

    #[tokio::test]
    async fn disconnected_catalog_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockClient::new();
        client.expect_get().times(1).returning(|_, _, _| {
            Ok(json!({"status": {"connectionState": {"lastObservedState": "TRANSIENT_FAILURE"}}}))
        });

        let ctx = context(client, tmp.path());
        let err = run(&ctx, &DeployOperatorArgs::default()).await.unwrap_err();
        assert!(err.to_string().contains("TRANSIENT_FAILURE"));
    }
}
