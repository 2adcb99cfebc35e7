//! Cluster connection check
//!
//! Records the Kubernetes and OpenShift versions of the cluster under test.

use std::path::Path;

use clap::Args;
use converge_core::Snapshot;
use converge_kube::resource::CLUSTER_VERSION;
use tracing::info;

use super::{str_at, StepContext};
use crate::{Error, Result};

/// Name of the cluster's singleton ClusterVersion
pub const CLUSTER_VERSION_NAME: &str = "version";

/// Check the cluster can be reached
#[derive(Args, Debug, Clone, Default)]
pub struct CheckConnectionArgs {}

/// Fail early when an explicit kubeconfig path does not exist
pub fn check_kubeconfig(kubeconfig: Option<&Path>) -> Result<()> {
    match kubeconfig {
        Some(path) if !path.is_file() => Err(Error::validation(format!(
            "kubeconfig {} is not a readable file",
            path.display()
        ))),
        Some(path) => {
            info!(kubeconfig = %path.display(), "Using kubeconfig");
            Ok(())
        }
        None => Ok(()),
    }
}

/// Run the connection check
pub async fn run(ctx: &StepContext, _args: &CheckConnectionArgs) -> Result<()> {
    check_kubeconfig(ctx.config.kubeconfig.as_deref())?;

    let kubernetes = ctx.client().server_version().await?;
    let cluster_version = ctx
        .client()
        .get(&CLUSTER_VERSION, "", CLUSTER_VERSION_NAME)
        .await?;
    let openshift = completed_version(&cluster_version).unwrap_or("unknown");

    let message = format!("K8s Version: {}\nOCP Version: {}\n", kubernetes, openshift);
    ctx.record_text("OCP_Version.txt", &message).await?;
    info!(kubernetes = %kubernetes, openshift = %openshift, "Connected to cluster");
    Ok(())
}

/// Most recent completed version in a ClusterVersion's update history
///
/// History is ordered newest first; an update still in progress is skipped.
pub fn completed_version(cluster_version: &Snapshot) -> Option<&str> {
    cluster_version
        .pointer("/status/history")?
        .as_array()?
        .iter()
        .find(|entry| str_at(entry, "/state") == Some("Completed"))
        .and_then(|entry| str_at(entry, "/version"))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use serde_json::json;

    fn cluster_version() -> Snapshot {
        json!({
            "metadata": {"name": "version"},
            "status": {"history": [
                {"state": "Partial", "version": "4.14.2"},
                {"state": "Completed", "version": "4.14.1"},
                {"state": "Completed", "version": "4.13.19"}
            ]}
        })
    }

    #[test]
    fn newest_completed_version_wins() {
        assert_eq!(completed_version(&cluster_version()), Some("4.14.1"));
        assert_eq!(completed_version(&json!({"status": {"history": []}})), None);
    }

    #[test]
    fn missing_kubeconfig_is_a_validation_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("kubeconfig");
        assert!(matches!(
            check_kubeconfig(Some(&missing)),
            Err(Error::Validation { .. })
        ));
        std::fs::write(&missing, "apiVersion: v1\n").unwrap();
        assert!(check_kubeconfig(Some(&missing)).is_ok());
        assert!(check_kubeconfig(None).is_ok());
    }

    #[tokio::test]
    async fn records_server_versions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockClient::new();
        client
            .expect_server_version()
            .times(1)
            .returning(|| Ok("v1.27.6+f67aeb3".to_string()));
        client
            .expect_get()
            .withf(|kind, _, name| *kind == CLUSTER_VERSION && name == "version")
            .times(1)
            .returning(|_, _, _| Ok(cluster_version()));

        let ctx = context(client, tmp.path());
        run(&ctx, &CheckConnectionArgs::default()).await.unwrap();

        assert_eq!(
            artifact(tmp.path(), "OCP_Version.txt"),
            "K8s Version: v1.27.6+f67aeb3\nOCP Version: 4.14.1\n"
        );
    }

    #[tokio::test]
    async fn unreachable_api_server_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockClient::new();
        client
            .expect_server_version()
            .returning(|| Err(converge_kube::Error::internal("connection refused")));

        let ctx = context(client, tmp.path());
        let err = run(&ctx, &CheckConnectionArgs::default()).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(!tmp.path().join("OCP_Version.txt").exists());
    }
}
