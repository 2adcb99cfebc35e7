//! Scale a GPU worker MachineSet
//!
//! Reuses a worker MachineSet that already has the requested instance type,
//! or clones the first worker MachineSet with the instance type swapped in.

use clap::Args;
use converge_core::observer::CountMatches;
use converge_core::Snapshot;
use converge_kube::resource::MACHINE_SET;
use converge_kube::wait::{wait_for_object, ObjectRef};
use serde_json::json;
use tracing::info;

use super::{budget, name_of, str_at, StepContext};
use crate::{Error, Result};

/// Label carrying a machine's role on a MachineSet template
pub const MACHINE_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-role";

/// Label tying machines to their MachineSet
pub const MACHINESET_LABEL: &str = "machine.openshift.io/cluster-api-machineset";

const READY_ATTEMPTS: u32 = 30;
const READY_INTERVAL_SECS: u64 = 30;

/// Ensure a GPU MachineSet with the configured instance type and replicas
#[derive(Args, Debug, Clone)]
pub struct ScaleGpuNodesArgs {
    /// Namespace holding the MachineSets
    #[arg(long, default_value = "openshift-machine-api")]
    pub machine_namespace: String,
}

impl Default for ScaleGpuNodesArgs {
    fn default() -> Self {
        Self {
            machine_namespace: "openshift-machine-api".to_string(),
        }
    }
}

/// Run the scale step
pub async fn run(ctx: &StepContext, args: &ScaleGpuNodesArgs) -> Result<()> {
    let instance_type = ctx.config.gpu_instance_type.as_str();
    let replicas = ctx.config.gpu_replicas;

    let workers: Vec<Snapshot> = ctx
        .client()
        .list(&MACHINE_SET, &args.machine_namespace, "")
        .await?
        .into_iter()
        .filter(is_worker)
        .collect();
    if workers.is_empty() {
        return Err(Error::step_failed("MachineSet lookup", "no worker MachineSets found"));
    }
    for ms in &workers {
        let name = name_of(ms).unwrap_or_default();
        ctx.record_json(&format!("worker_ms-{}.json", name), ms).await?;
    }

    let name = match workers.iter().find(|ms| instance_type_of(ms) == Some(instance_type)) {
        Some(existing) => {
            let name = name_of(existing).unwrap_or_default().to_string();
            info!(machineset = %name, instance_type = %instance_type, "Reusing MachineSet");
            name
        }
        None => {
            let manifest = clone_for_instance_type(&workers[0], instance_type, replicas)?;
            let created = ctx
                .client()
                .create(&MACHINE_SET, &args.machine_namespace, &manifest)
                .await?;
            let name = name_of(&created).unwrap_or_default().to_string();
            info!(machineset = %name, instance_type = %instance_type, "Created MachineSet");
            ctx.record_json(&format!("new_machineset-{}.json", name), &created)
                .await?;
            name
        }
    };

    ctx.client()
        .patch(
            &MACHINE_SET,
            &args.machine_namespace,
            &name,
            &json!({"spec": {"replicas": replicas}}),
        )
        .await?;

    let spec = budget("MachineSet ready state", READY_ATTEMPTS, READY_INTERVAL_SECS)?;
    wait_for_object(
        ctx.client(),
        &spec,
        ctx.poll(),
        &ObjectRef::new(MACHINE_SET, &args.machine_namespace, &name),
        &CountMatches::machineset(),
    )
    .await?;
    Ok(())
}

fn is_worker(ms: &Snapshot) -> bool {
    ms.pointer("/spec/template/metadata/labels")
        .and_then(|labels| labels.get(MACHINE_ROLE_LABEL))
        .and_then(|v| v.as_str())
        == Some("worker")
}

fn instance_type_of(ms: &Snapshot) -> Option<&str> {
    str_at(ms, "/spec/template/spec/providerSpec/value/instanceType")
}

/// Copy a worker MachineSet, renamed and relabelled for `instance_type`
pub fn clone_for_instance_type(base: &Snapshot, instance_type: &str, replicas: u32) -> Result<Snapshot> {
    let base_name = name_of(base)
        .ok_or_else(|| Error::step_failed("MachineSet clone", "base MachineSet has no name"))?;
    let name = format!("{}-{}", base_name, instance_type.replace('.', "-"));

    let mut ms = base.clone();
    ms.as_object_mut()
        .map(|obj| obj.remove("status"))
        .ok_or_else(|| Error::step_failed("MachineSet clone", "base MachineSet is not an object"))?;

    let metadata = &mut ms["metadata"];
    metadata["name"] = json!(name);
    if let Some(meta) = metadata.as_object_mut() {
        for field in ["uid", "resourceVersion", "creationTimestamp", "generation", "managedFields"] {
            meta.remove(field);
        }
    }

    ms["spec"]["selector"]["matchLabels"][MACHINESET_LABEL] = json!(name);
    ms["spec"]["template"]["metadata"]["labels"][MACHINESET_LABEL] = json!(name);
    ms["spec"]["template"]["spec"]["providerSpec"]["value"]["instanceType"] = json!(instance_type);
    ms["spec"]["replicas"] = json!(replicas);
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    fn worker(name: &str, instance_type: &str) -> Snapshot {
        json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "MachineSet",
            "metadata": {"name": name, "namespace": "openshift-machine-api", "uid": "abc", "resourceVersion": "7"},
            "spec": {
                "replicas": 0,
                "selector": {"matchLabels": {MACHINESET_LABEL: name}},
                "template": {
                    "metadata": {"labels": {MACHINE_ROLE_LABEL: "worker", MACHINESET_LABEL: name}},
                    "spec": {"providerSpec": {"value": {"instanceType": instance_type}}}
                }
            },
            "status": {"readyReplicas": 0}
        })
    }

    #[test]
    fn clone_renames_and_relabels() {
        let ms = clone_for_instance_type(&worker("ci-worker-us-east-1a", "m5.xlarge"), "g4dn.xlarge", 2)
            .unwrap();
        let name = "ci-worker-us-east-1a-g4dn-xlarge";
        assert_eq!(ms["metadata"]["name"], name);
        assert!(ms["metadata"].get("uid").is_none());
        assert!(ms["metadata"].get("resourceVersion").is_none());
        assert!(ms.get("status").is_none());
        assert_eq!(ms["spec"]["selector"]["matchLabels"][MACHINESET_LABEL], name);
        assert_eq!(ms["spec"]["template"]["metadata"]["labels"][MACHINESET_LABEL], name);
        assert_eq!(instance_type_of(&ms), Some("g4dn.xlarge"));
        assert_eq!(ms["spec"]["replicas"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn creates_clone_when_instance_type_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockClient::new();
        client
            .expect_list()
            .returning(|_, _, _| Ok(vec![worker("ci-worker-a", "m5.xlarge"), json!({"metadata": {"name": "infra"}})]));
        client
            .expect_create()
            .withf(|_, _, obj| obj["metadata"]["name"] == "ci-worker-a-g4dn-xlarge")
            .times(1)
            .returning(|_, _, obj| Ok(obj.clone()));
        client
            .expect_patch()
            .withf(|_, _, name, patch| name == "ci-worker-a-g4dn-xlarge" && patch["spec"]["replicas"] == 1)
            .times(1)
            .returning(|_, _, _, patch| Ok(patch.clone()));

        let mut seq = mockall::Sequence::new();
        client
            .expect_get()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(json!({"spec": {"replicas": 1}, "status": {"readyReplicas": 0}})));
        client
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(json!({"spec": {"replicas": 1}, "status": {"readyReplicas": 1}})));

        let ctx = context(client, tmp.path());
        run(&ctx, &ScaleGpuNodesArgs::default()).await.unwrap();

        assert!(tmp.path().join("worker_ms-ci-worker-a.json").exists());
        assert!(tmp.path().join("new_machineset-ci-worker-a-g4dn-xlarge.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_matching_machineset() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockClient::new();
        client
            .expect_list()
            .returning(|_, _, _| Ok(vec![worker("ci-worker-a", "m5.xlarge"), worker("ci-gpu", "g4dn.xlarge")]));
        client.expect_create().never();
        client
            .expect_patch()
            .withf(|_, _, name, _| name == "ci-gpu")
            .times(1)
            .returning(|_, _, _, patch| Ok(patch.clone()));
        client
            .expect_get()
            .returning(|_, _, _| Ok(json!({"spec": {"replicas": 1}, "status": {"readyReplicas": 1}})));

        let ctx = context(client, tmp.path());
        run(&ctx, &ScaleGpuNodesArgs::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn scaling_to_zero_converges_without_ready_replicas() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockClient::new();
        client
            .expect_list()
            .returning(|_, _, _| Ok(vec![worker("ci-gpu", "g4dn.xlarge")]));
        client
            .expect_patch()
            .withf(|_, _, name, patch| name == "ci-gpu" && patch["spec"]["replicas"] == 0)
            .times(1)
            .returning(|_, _, _, patch| Ok(patch.clone()));
        client
            .expect_get()
            .times(1)
            .returning(|_, _, _| Ok(json!({"spec": {"replicas": 0}, "status": {}})));

        let mut ctx = context(client, tmp.path());
        ctx.config.gpu_replicas = 0;
        run(&ctx, &ScaleGpuNodesArgs::default()).await.unwrap();
    }
}
