//! Deploy the Node Feature Discovery operator
//!
//! NFD labels nodes with their hardware features; the GPU operator relies on
//! those labels to find GPU nodes. The subscription follows the package's
//! default channel and catalog.

use clap::Args;
use converge_core::observer::PhaseReached;
use converge_core::Snapshot;
use converge_kube::ensure_created;
use converge_kube::resource::{
    CLUSTER_SERVICE_VERSION, NODE, NODE_FEATURE_DISCOVERY, PACKAGE_MANIFEST, SUBSCRIPTION,
};
use converge_kube::wait::{wait_for_non_empty, wait_for_single};
use serde_json::json;
use tracing::{info, warn};

use super::{
    budget, ensure_namespace, ensure_operator_group, first_alm_example, name_of, str_at,
    StepContext,
};
use crate::{Error, Result};

/// OLM package name of the NFD operator
pub const NFD_PACKAGE: &str = "nfd";

/// Node label NFD sets on RHCOS hosts once it has scanned them
pub const RHCOS_NODE_LABEL: &str = "feature.node.kubernetes.io/system-os_release.ID=rhcos";

const CSV_ATTEMPTS: u32 = 40;
const CSV_INTERVAL_SECS: u64 = 30;
const LABELS_ATTEMPTS: u32 = 20;
const LABELS_INTERVAL_SECS: u64 = 30;

/// Deploy the NFD operator and an NFD instance
#[derive(Args, Debug, Clone)]
pub struct DeployNfdArgs {
    /// Namespace of the PackageManifest
    #[arg(long, default_value = "openshift-marketplace")]
    pub catalog_namespace: String,

    /// OLM package name
    #[arg(long, default_value = NFD_PACKAGE)]
    pub package: String,

    /// Name of the NodeFeatureDiscovery resource to create
    #[arg(long, default_value = "nfd-cr-testing")]
    pub cr_name: String,
}

impl Default for DeployNfdArgs {
    fn default() -> Self {
        Self {
            catalog_namespace: "openshift-marketplace".to_string(),
            package: NFD_PACKAGE.to_string(),
            cr_name: "nfd-cr-testing".to_string(),
        }
    }
}

/// Where the package manifest says to subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSource {
    /// Default channel of the package
    pub channel: String,
    /// CatalogSource serving the package
    pub catalog_source: String,
    /// Namespace of that CatalogSource
    pub catalog_namespace: String,
}

impl PackageSource {
    /// Read the default channel and catalog from a PackageManifest
    pub fn from_manifest(manifest: &Snapshot) -> Result<Self> {
        let field = |pointer: &str| {
            str_at(manifest, pointer)
                .map(str::to_string)
                .ok_or_else(|| Error::step_failed("PackageManifest", format!("{} is missing", pointer)))
        };
        Ok(Self {
            channel: field("/status/defaultChannel")?,
            catalog_source: field("/status/catalogSource")?,
            catalog_namespace: field("/status/catalogSourceNamespace")?,
        })
    }
}

/// Run the NFD deploy step
pub async fn run(ctx: &StepContext, args: &DeployNfdArgs) -> Result<()> {
    let namespace = ctx.config.namespace.clone();

    let manifest = ctx
        .client()
        .get(&PACKAGE_MANIFEST, &args.catalog_namespace, &args.package)
        .await?;
    ctx.record_json("nfd_packagemanifest.json", &manifest).await?;
    let source = PackageSource::from_manifest(&manifest)?;
    info!(package = %args.package, channel = %source.channel, "NFD PackageManifest default channel");

    let ns = ensure_namespace(ctx, &namespace).await?;
    ctx.record_json("namespace.json", &ns).await?;
    ensure_operator_group(ctx, &namespace).await?;

    let subscription = ensure_created(
        ctx.client(),
        &SUBSCRIPTION,
        &namespace,
        &subscription_manifest(&args.package, &namespace, &source),
    )
    .await?;
    ctx.record_json("nfd_subscription.json", &subscription).await?;

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
    ctx.record_json("nfd_csv.json", &csv).await?;
    let version = str_at(&csv, "/spec/version")
        .ok_or_else(|| Error::step_failed("record CSV", "CSV has no spec.version"))?;
    ctx.record_text("nfd_version.txt", version).await?;

    let mut instance = first_alm_example(&csv)?;
    instance["metadata"]["namespace"] = json!(namespace);
    instance["metadata"]["name"] = json!(args.cr_name);
    let created = ctx
        .client()
        .create(&NODE_FEATURE_DISCOVERY, &namespace, &instance)
        .await?;
    info!(name = name_of(&created).unwrap_or_default(), "Created NodeFeatureDiscovery");
    ctx.record_json("nfd_cr_create_response.json", &created).await?;

    let spec = budget("wait for NFD labels", LABELS_ATTEMPTS, LABELS_INTERVAL_SECS)?;
    let labelled =
        wait_for_non_empty(ctx.client(), &spec, ctx.poll(), &NODE, "", RHCOS_NODE_LABEL).await;
    if let Err(e) = &labelled {
        warn!(error = %e, "Failed to find NFD labels on nodes");
    }

    // The CR is recorded whether or not the labels showed up
    let cr = ctx
        .client()
        .get(&NODE_FEATURE_DISCOVERY, &namespace, &args.cr_name)
        .await?;
    ctx.record_json("nfd_cr.json", &cr).await?;

    let nodes = labelled?;
    info!(count = nodes.len(), "NFD labelled nodes");
    Ok(())
}

fn subscription_manifest(package: &str, namespace: &str, source: &PackageSource) -> Snapshot {
    json!({
        "apiVersion": SUBSCRIPTION.api_version,
        "kind": SUBSCRIPTION.kind,
        "metadata": {"name": package, "namespace": namespace},
        "spec": {
            "channel": source.channel,
            "installPlanApproval": "Automatic",
            "name": package,
            "source": source.catalog_source,
            "sourceNamespace": source.catalog_namespace
        }
    })
}
