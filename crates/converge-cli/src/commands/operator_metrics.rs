//! GPU operator metrics checks
//!
//! Makes sure cluster monitoring scrapes the operator namespace, that every
//! DCGM exporter pod serves metrics, and that Prometheus has picked up the
//! exporter's ServiceMonitor.

use clap::Args;
use converge_core::observer::{LabelPresent, PatternInLog};
use converge_core::{observe, poll_with, Observer, ObserverState};
use converge_kube::resource::{NAMESPACE, POD, SECRET};
use converge_kube::secret::gzipped_secret_value;
use converge_kube::wait::wait_for_logs;
use semver::{BuildMetadata, Version};
use serde_json::json;
use tracing::{info, warn};

use super::{budget, find_operator_csv, name_of, str_at, StepContext, GPU_OPERATOR_PACKAGE};
use crate::{Error, Result};

/// Namespace label that opts a namespace into cluster monitoring
pub const MONITORING_LABEL: &str = "openshift.io/cluster-monitoring";

/// Newest operator release that does not label its namespace itself
pub const LAST_UNLABELLED_VERSION: Version = Version::new(1, 9, 1);

/// Label selecting the DCGM exporter pods
pub const DCGM_EXPORTER_SELECTOR: &str = "app=nvidia-dcgm-exporter";

/// Lines the DCGM exporter logs once it serves metrics
pub const DCGM_READY_PATTERNS: [&str; 3] = [
    "DCGM successfully initialized!",
    "Kubernetes metrics collection enabled!",
    "Starting webserver",
];

/// Port the DCGM exporter serves metrics on
pub const DCGM_METRICS_PORT: u16 = 9400;

/// Namespace of the cluster monitoring stack
pub const MONITORING_NAMESPACE: &str = "openshift-monitoring";

/// Secret holding the generated Prometheus configuration
pub const PROMETHEUS_SECRET: &str = "prometheus-k8s";

/// Key of the gzipped configuration in [`PROMETHEUS_SECRET`]
pub const PROMETHEUS_CONFIG_KEY: &str = "prometheus.yaml.gz";

const LOGS_ATTEMPTS: u32 = 15;
const LOGS_INTERVAL_SECS: u64 = 30;
const PICKUP_ATTEMPTS: u32 = 30;
const PICKUP_INTERVAL_SECS: u64 = 30;

/// Check operator metrics exposure
#[derive(Args, Debug, Clone)]
pub struct OperatorMetricsArgs {
    /// Substring identifying the operator CSV
    #[arg(long, default_value = GPU_OPERATOR_PACKAGE)]
    pub package: String,
}

impl Default for OperatorMetricsArgs {
    fn default() -> Self {
        Self {
            package: GPU_OPERATOR_PACKAGE.to_string(),
        }
    }
}

/// Run the metrics step
pub async fn run(ctx: &StepContext, args: &OperatorMetricsArgs) -> Result<()> {
    let csv = find_operator_csv(ctx, &args.package).await?;
    ctx.record_json("gpu-operator-csv.json", &csv).await?;
    let namespace = str_at(&csv, "/metadata/namespace")
        .ok_or_else(|| Error::step_failed("find CSV", "CSV has no namespace"))?
        .to_string();
    let version = str_at(&csv, "/spec/version")
        .ok_or_else(|| Error::step_failed("find CSV", "CSV has no spec.version"))?;

    let version = parse_version(version).map_err(|e| {
        Error::step_failed("operator version", format!("cannot parse {:?}: {}", version, e))
    })?;
    if version <= LAST_UNLABELLED_VERSION {
        label_namespace(ctx, &namespace).await?;
    } else {
        info!(version = %version, "Operator labels its namespace, skipping patch");
    }

    let ns = ctx.client().get(&NAMESPACE, "", &namespace).await?;
    let monitored = LabelPresent::label(MONITORING_LABEL, "true");
    if monitored.classify(&ns) != ObserverState::Converged {
        return Err(Error::step_failed(
            "monitoring label check",
            format!(
                "namespace {} has {}={:?}, expected \"true\"",
                namespace,
                MONITORING_LABEL,
                monitored.value(&ns)
            ),
        ));
    }
    ctx.record_json("gpu_operator_namespace.json", &ns).await?;

    let pods = ctx
        .client()
        .list(&POD, &namespace, DCGM_EXPORTER_SELECTOR)
        .await?;
    let mut not_running = Vec::new();
    for pod in &pods {
        let name = name_of(pod).unwrap_or_default();
        ctx.record_json(&format!("pod_{}.json", name), pod).await?;
        if str_at(pod, "/status/phase") != Some("Running") {
            not_running.push(name.to_string());
        }
    }
    if !not_running.is_empty() {
        return Err(Error::step_failed(
            "DCGM exporter check",
            format!("pods not running: {}", not_running.join(", ")),
        ));
    }

    let pod_names = pods
        .iter()
        .filter_map(|pod| name_of(pod).map(str::to_string))
        .collect();
    let spec = budget("Waiting for valid output", LOGS_ATTEMPTS, LOGS_INTERVAL_SECS)?;
    wait_for_logs(
        ctx.client(),
        ctx.recorder(),
        &spec,
        ctx.poll(),
        &namespace,
        pod_names,
        &PatternInLog::all(DCGM_READY_PATTERNS),
    )
    .await?;
    info!(namespace = %namespace, pods = pods.len(), "DCGM exporters are serving metrics");

    let first = pods
        .first()
        .and_then(name_of)
        .ok_or_else(|| Error::step_failed("DCGM scrape pool", "no DCGM exporter pods"))?;
    check_scrape_pool(ctx, &namespace, first).await?;
    wait_for_service_monitor(ctx, &namespace).await
}

async fn check_scrape_pool(ctx: &StepContext, namespace: &str, pod: &str) -> Result<()> {
    let metrics = ctx
        .client()
        .proxy_get(namespace, pod, DCGM_METRICS_PORT, "metrics")
        .await?;
    if metrics.trim().is_empty() {
        return Err(Error::step_failed("DCGM scrape pool", "scrape pool is empty"));
    }
    ctx.record_text(&format!("{}_metrics_response.txt", pod), &metrics)
        .await
}

/// Scrape job Prometheus generates for the DCGM exporter ServiceMonitor
pub fn service_monitor_job(namespace: &str) -> String {
    format!("job_name: serviceMonitor/{}/nvidia-dcgm-exporter", namespace)
}

async fn prometheus_config(ctx: &StepContext) -> converge_kube::Result<String> {
    let secret = ctx
        .client()
        .get(&SECRET, MONITORING_NAMESPACE, PROMETHEUS_SECRET)
        .await?;
    gzipped_secret_value(&secret, PROMETHEUS_CONFIG_KEY)
}

/// Wait until the generated Prometheus configuration scrapes the DCGM exporter
async fn wait_for_service_monitor(ctx: &StepContext, namespace: &str) -> Result<()> {
    let spec = budget("DCGM prometheus pickup", PICKUP_ATTEMPTS, PICKUP_INTERVAL_SECS)?;
    let job = PatternInLog::all([service_monitor_job(namespace)]);

    let result = poll_with(&spec, ctx.poll(), || async {
        let config = prometheus_config(ctx).await;
        if let Ok(text) = &config {
            if let Err(e) = ctx.recorder().record_text("prometheus.yaml.gz.txt", text).await {
                warn!(error = %e, "Failed to record Prometheus configuration");
            }
        }
        observe(config, &job)
    })
    .await;

    result.into_result()?;
    info!(namespace = %namespace, "Prometheus is scraping the DCGM exporter");
    Ok(())
}

async fn label_namespace(ctx: &StepContext, namespace: &str) -> Result<()> {
    let before = ctx.client().get(&NAMESPACE, "", namespace).await?;
    ctx.record_json("gpu-operator-namespace-before-label-patch.json", &before)
        .await?;

    let patch = json!({"metadata": {"labels": {MONITORING_LABEL: "true"}}});
    let after = ctx.client().patch(&NAMESPACE, "", namespace, &patch).await?;
    info!(namespace = %namespace, label = MONITORING_LABEL, "Labelled operator namespace");
    ctx.record_json("gpu-operator-namespace-after-label-patch.json", &after)
        .await
}

/// Parse an operator version, ignoring build metadata
pub fn parse_version(version: &str) -> std::result::Result<Version, semver::Error> {
    let mut parsed = Version::parse(version.trim_start_matches('v'))?;
    parsed.build = BuildMetadata::EMPTY;
    Ok(parsed)
}
