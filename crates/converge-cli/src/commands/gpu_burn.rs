//! GPU burn workload
//!
//! Runs gpu-burn on every GPU node through a DaemonSet, waits for each pod's
//! log to report a clean run, then removes the test namespace.

use std::collections::BTreeMap;

use clap::Args;
use converge_core::observer::{CountMatches, PatternInLog};
use converge_core::Snapshot;
use converge_kube::ensure_created;
use converge_kube::resource::{CONFIG_MAP, DAEMON_SET, NAMESPACE, POD};
use converge_kube::wait::{
    wait_for_absence, wait_for_logs, wait_for_non_empty, wait_for_object, ObjectRef,
};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, Namespace, PodSecurityContext,
    PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::info;

use super::{budget, name_of, StepContext};
use crate::Result;

/// Default namespace for the burn workload
pub const DEFAULT_BURN_NAMESPACE: &str = "gpu-burn-test";

/// Default gpu-burn image
pub const DEFAULT_BURN_IMAGE: &str = "quay.io/openshift-psap/gpu-burn";

const DAEMONSET_NAME: &str = "gpu-burn-daemonset";
const APP_LABEL: &str = "gpu-burn-daemonset";
const ENTRYPOINT_CONFIG_MAP: &str = "gpu-burn-entrypoint";
const ENTRYPOINT_KEY: &str = "entrypoint.sh";

const ENTRYPOINT_SCRIPT: &str = r#"#!/bin/bash
NUM_GPUS=$(nvidia-smi -L | wc -l)
if [ $NUM_GPUS -eq 0 ]; then
  echo "ERROR No GPUs found"
  exit 1
fi
/usr/local/bin/gpu-burn 300
if [ ! $? -eq 0 ]; then
  exit 1
fi
"#;

/// Lines gpu-burn prints after a clean run
pub const BURN_SUCCESS_PATTERNS: [&str; 2] = ["GPU 0: OK", "100.0%  proc'd:"];

const READY_ATTEMPTS: u32 = 20;
const READY_INTERVAL_SECS: u64 = 30;
const PODS_ATTEMPTS: u32 = 15;
const PODS_INTERVAL_SECS: u64 = 30;
const BURN_ATTEMPTS: u32 = 60;
const BURN_INTERVAL_SECS: u64 = 60;
const CLEANUP_ATTEMPTS: u32 = 60;
const CLEANUP_INTERVAL_SECS: u64 = 10;

/// Run gpu-burn on all GPU nodes
#[derive(Args, Debug, Clone)]
pub struct GpuBurnArgs {
    /// Namespace created for the workload and deleted afterwards
    #[arg(long, default_value = DEFAULT_BURN_NAMESPACE)]
    pub burn_namespace: String,

    /// gpu-burn container image
    #[arg(long, default_value = DEFAULT_BURN_IMAGE)]
    pub image: String,
}

impl Default for GpuBurnArgs {
    fn default() -> Self {
        Self {
            burn_namespace: DEFAULT_BURN_NAMESPACE.to_string(),
            image: DEFAULT_BURN_IMAGE.to_string(),
        }
    }
}

/// Run the burn step
pub async fn run(ctx: &StepContext, args: &GpuBurnArgs) -> Result<()> {
    let ns = args.burn_namespace.as_str();

    let manifest = to_snapshot(&namespace(ns))?;
    let namespace = ensure_created(ctx.client(), &NAMESPACE, "", &manifest).await?;
    ctx.record_json("gpu_burn_namespace.json", &namespace).await?;

    let manifest = to_snapshot(&entrypoint_config_map(ns))?;
    let config_map = ensure_created(ctx.client(), &CONFIG_MAP, ns, &manifest).await?;
    ctx.record_json("gpu_burn_configmap.json", &config_map).await?;

    ensure_created(
        ctx.client(),
        &DAEMON_SET,
        ns,
        &to_snapshot(&burn_daemonset(ns, &args.image))?,
    )
    .await?;
    info!(namespace = %ns, image = %args.image, "Created gpu-burn DaemonSet");

    let spec = budget(
        "DaemonSet state check. Desired vs Ready",
        READY_ATTEMPTS,
        READY_INTERVAL_SECS,
    )?;
    let daemonset = wait_for_object(
        ctx.client(),
        &spec,
        ctx.poll(),
        &ObjectRef::new(DAEMON_SET, ns, DAEMONSET_NAME),
        &CountMatches::daemonset(),
    )
    .await?;
    ctx.record_json("gpu_burn_daemonset.json", &daemonset).await?;

    let spec = budget("Get Daemonset pods", PODS_ATTEMPTS, PODS_INTERVAL_SECS)?;
    let selector = format!("app={}", APP_LABEL);
    let pods = wait_for_non_empty(ctx.client(), &spec, ctx.poll(), &POD, ns, &selector).await?;
    let pod_names: Vec<String> = pods
        .iter()
        .filter_map(|pod| name_of(pod).map(str::to_string))
        .collect();
    info!(pods = pod_names.len(), "Waiting for gpu-burn to finish");

    let spec = budget("Wait for GPU Burn to finish", BURN_ATTEMPTS, BURN_INTERVAL_SECS)?;
    wait_for_logs(
        ctx.client(),
        ctx.recorder(),
        &spec,
        ctx.poll(),
        ns,
        pod_names,
        &PatternInLog::all(BURN_SUCCESS_PATTERNS),
    )
    .await?;

    ctx.client().delete(&NAMESPACE, "", ns).await?;
    let spec = budget(
        "Wait until namespace is deleted",
        CLEANUP_ATTEMPTS,
        CLEANUP_INTERVAL_SECS,
    )?;
    let target = ObjectRef::cluster(NAMESPACE, ns);
    wait_for_absence(ctx.client(), &spec, ctx.poll(), &target).await?;
    info!(namespace = %ns, "Removed gpu-burn namespace");
    Ok(())
}

fn to_snapshot<T: serde::Serialize>(resource: &T) -> Result<Snapshot> {
    Ok(serde_json::to_value(resource)?)
}

fn app_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), APP_LABEL.to_string())])
}

fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn entrypoint_config_map(namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(ENTRYPOINT_CONFIG_MAP.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            ENTRYPOINT_KEY.to_string(),
            ENTRYPOINT_SCRIPT.to_string(),
        )])),
        ..Default::default()
    }
}

/// gpu-burn DaemonSet pinned to GPU workers, one GPU per pod
pub fn burn_daemonset(namespace: &str, image: &str) -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta {
            name: Some(DAEMONSET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(app_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app_labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        ..Default::default()
                    }),
                    tolerations: Some(vec![
                        Toleration {
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        },
                        Toleration {
                            key: Some("nvidia.com/gpu".to_string()),
                            effect: Some("NoSchedule".to_string()),
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        },
                    ]),
                    containers: vec![Container {
                        name: "gpu-burn-ctr".to_string(),
                        image: Some(image.to_string()),
                        image_pull_policy: Some("Always".to_string()),
                        security_context: Some(SecurityContext {
                            allow_privilege_escalation: Some(false),
                            capabilities: Some(Capabilities {
                                drop: Some(vec!["ALL".to_string()]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        command: Some(vec!["/bin/entrypoint.sh".to_string()]),
                        resources: Some(ResourceRequirements {
                            limits: Some(BTreeMap::from([(
                                "nvidia.com/gpu".to_string(),
                                Quantity("1".to_string()),
                            )])),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "entrypoint".to_string(),
                            mount_path: "/bin/entrypoint.sh".to_string(),
                            read_only: Some(true),
                            sub_path: Some(ENTRYPOINT_KEY.to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "entrypoint".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: ENTRYPOINT_CONFIG_MAP.to_string(),
                            default_mode: Some(0o777),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    node_selector: Some(BTreeMap::from([
                        ("nvidia.com/gpu.present".to_string(), "true".to_string()),
                        ("node-role.kubernetes.io/worker".to_string(), String::new()),
                    ])),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
