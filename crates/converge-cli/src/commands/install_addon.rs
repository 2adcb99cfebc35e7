//! Managed GPU add-on installation
//!
//! Credentials come from the CI secret on the cluster itself. In the
//! production environment the RHODS add-on is installed first.

use clap::Args;
use converge_kube::addon::{is_installed, wait_for_addon, AddonClient, AddonPayload};
use converge_kube::resource::SECRET;
use converge_kube::secret::secret_value;
use tracing::info;

use super::{budget, StepContext};
use crate::Result;

/// Namespace of the CI credentials secret
pub const DEFAULT_SECRET_NAMESPACE: &str = "osde2e-ci-secrets";

/// Name of the CI credentials secret
pub const DEFAULT_SECRET_NAME: &str = "ci-secrets";

/// Id of the NVIDIA GPU add-on
pub const GPU_ADDON_ID: &str = "nvidia-gpu-addon";

/// Id of the RHODS add-on
pub const RHODS_ADDON_ID: &str = "managed-odh";

/// OCM environment that also gets RHODS
pub const PRODUCTION_ENV: &str = "prod";

const TOKEN_KEY: &str = "ocm-token-refresh";
const ENV_KEY: &str = "ENV";
const CLUSTER_ID_KEY: &str = "CLUSTER_ID";

const INSTALL_ATTEMPTS: u32 = 60;
const INSTALL_INTERVAL_SECS: u64 = 60;

/// Install the GPU add-on through OCM
#[derive(Args, Debug, Clone)]
pub struct InstallAddonArgs {
    /// Namespace of the secret holding OCM credentials
    #[arg(long, default_value = DEFAULT_SECRET_NAMESPACE)]
    pub secret_namespace: String,

    /// Name of the secret holding OCM credentials
    #[arg(long, default_value = DEFAULT_SECRET_NAME)]
    pub secret_name: String,

    /// Notification e-mail passed to the RHODS add-on
    #[arg(long, default_value = "example@example.com")]
    pub notification_email: String,
}

impl Default for InstallAddonArgs {
    fn default() -> Self {
        Self {
            secret_namespace: DEFAULT_SECRET_NAMESPACE.to_string(),
            secret_name: DEFAULT_SECRET_NAME.to_string(),
            notification_email: "example@example.com".to_string(),
        }
    }
}

/// OCM credentials read from the CI secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcmCredentials {
    /// Refresh token
    pub token: String,
    /// OCM environment, used as the login URL
    pub env: String,
    /// Cluster the add-ons are installed on
    pub cluster_id: String,
}

/// Run the add-on step
pub async fn run(ctx: &StepContext, ocm: &dyn AddonClient, args: &InstallAddonArgs) -> Result<()> {
    let creds = read_credentials(ctx, args).await?;
    ocm.login(&creds.token, &creds.env).await?;
    info!(env = %creds.env, cluster_id = %creds.cluster_id, "Logged in to OCM");

    if creds.env == PRODUCTION_ENV {
        let payload = AddonPayload::new(RHODS_ADDON_ID)
            .with_parameter("notification-email", &args.notification_email);
        install(ctx, ocm, &creds.cluster_id, "rhods", &payload).await?;
    } else {
        info!(env = %creds.env, "RHODS is only installed in production");
    }

    install(ctx, ocm, &creds.cluster_id, "gpu", &AddonPayload::new(GPU_ADDON_ID)).await
}

/// Read token, environment and cluster id from the CI secret
pub async fn read_credentials(ctx: &StepContext, args: &InstallAddonArgs) -> Result<OcmCredentials> {
    let secret = ctx
        .client()
        .get(&SECRET, &args.secret_namespace, &args.secret_name)
        .await?;
    Ok(OcmCredentials {
        token: secret_value(&secret, TOKEN_KEY)?,
        env: secret_value(&secret, ENV_KEY)?,
        cluster_id: secret_value(&secret, CLUSTER_ID_KEY)?,
    })
}

/// Install one add-on unless it is already present, then wait for `ready`
async fn install(
    ctx: &StepContext,
    ocm: &dyn AddonClient,
    cluster_id: &str,
    short_name: &str,
    payload: &AddonPayload,
) -> Result<()> {
    let addon_id = payload.addon.id.as_str();
    let initial = ocm.get_addon(cluster_id, addon_id).await?;
    ctx.record_json(&format!("{}-addon-initial-response.json", short_name), &initial)
        .await?;

    if is_installed(&initial) {
        info!(addon = %addon_id, "Add-on already installed");
    } else {
        info!(addon = %addon_id, "Add-on not found on cluster, installing");
        let body = payload.to_snapshot()?;
        ctx.record_json(&format!("ocm-{}-addon-payload.json", short_name), &body)
            .await?;
        let response = ocm.install_addon(cluster_id, &body).await?;
        ctx.record_json("ocm-addon-install-resp.json", &response)
            .await?;
    }

    let spec = budget(
        &format!("wait for {} install state", addon_id),
        INSTALL_ATTEMPTS,
        INSTALL_INTERVAL_SECS,
    )?;
    wait_for_addon(ocm, ctx.recorder(), &spec, ctx.poll(), cluster_id, addon_id).await?;
    info!(addon = %addon_id, "Add-on is ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use async_trait::async_trait;
    use converge_core::Snapshot;
    use mockall::mock;
    use serde_json::json;

    // Local mock for AddonClient since the mockall-generated mock is only
    // available within the converge-kube crate's test configuration
    mock! {
        pub Ocm {}

        #[async_trait]
        impl AddonClient for Ocm {
            async fn login(&self, token: &str, url: &str) -> converge_kube::Result<()>;
            async fn get_addon(&self, cluster_id: &str, addon_id: &str)
                -> converge_kube::Result<Snapshot>;
            async fn install_addon(&self, cluster_id: &str, payload: &Snapshot)
                -> converge_kube::Result<Snapshot>;
        }
    }

    fn secret(env: &str) -> Snapshot {
        json!({
            "metadata": {"name": "ci-secrets"},
            "stringData": {"ocm-token-refresh": "tok", "ENV": env, "CLUSTER_ID": "c-123"}
        })
    }

    fn cluster(env: &'static str) -> MockClient {
        let mut client = MockClient::new();
        client
            .expect_get()
            .withf(|kind, ns, name| *kind == SECRET && ns == "osde2e-ci-secrets" && name == "ci-secrets")
            .returning(move |_, _, _| Ok(secret(env)));
        client
    }

    #[tokio::test(start_paused = true)]
    async fn installs_missing_gpu_addon_in_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ocm = MockOcm::new();
        ocm.expect_login()
            .withf(|token, url| token == "tok" && url == "staging")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut seq = mockall::Sequence::new();
        ocm.expect_get_addon()
            .withf(|cluster, addon| cluster == "c-123" && addon == GPU_ADDON_ID)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(json!({"kind": "Error", "id": "404", "reason": "not found"})));
        ocm.expect_install_addon()
            .withf(|_, payload| payload == &json!({"addon": {"id": GPU_ADDON_ID}}))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(json!({"kind": "AddOnInstallation", "state": "installing"})));
        ocm.expect_get_addon()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(json!({"kind": "AddOnInstallation", "state": "installing"})));
        ocm.expect_get_addon()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(json!({"kind": "AddOnInstallation", "state": "ready"})));

        let ctx = context(cluster("staging"), tmp.path());
        run(&ctx, &ocm, &InstallAddonArgs::default()).await.unwrap();

        assert!(artifact(tmp.path(), "gpu-addon-initial-response.json").contains("not found"));
        assert!(tmp.path().join("ocm-gpu-addon-payload.json").exists());
        assert!(artifact(tmp.path(), "addon-nvidia-gpu-addon-ocm-response.json").contains("ready"));
        assert!(!tmp.path().join("rhods-addon-initial-response.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn production_installs_rhods_first() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ocm = MockOcm::new();
        ocm.expect_login().returning(|_, _| Ok(()));
        ocm.expect_get_addon()
            .returning(|_, _| Ok(json!({"kind": "AddOnInstallation", "state": "ready"})));
        ocm.expect_install_addon().never();

        let ctx = context(cluster("prod"), tmp.path());
        run(&ctx, &ocm, &InstallAddonArgs::default()).await.unwrap();

        assert!(tmp.path().join("rhods-addon-initial-response.json").exists());
        assert!(tmp.path().join("addon-managed-odh-ocm-response.json").exists());
        assert!(tmp.path().join("addon-nvidia-gpu-addon-ocm-response.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_addon_stops_the_wait() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ocm = MockOcm::new();
        ocm.expect_login().returning(|_, _| Ok(()));
        ocm.expect_get_addon()
            .times(2)
            .returning(|_, _| Ok(json!({"kind": "AddOnInstallation", "state": "failed"})));

        let ctx = context(cluster("staging"), tmp.path());
        let start = tokio::time::Instant::now();
        let err = run(&ctx, &ocm, &InstallAddonArgs::default()).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
        assert_eq!(start.elapsed(), std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn missing_secret_key_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut client = MockClient::new();
        client
            .expect_get()
            .returning(|_, _, _| Ok(json!({"metadata": {"name": "ci-secrets"}, "data": {}})));
        let ocm = MockOcm::new();

        let ctx = context(client, tmp.path());
        let err = run(&ctx, &ocm, &InstallAddonArgs::default()).await.unwrap_err();
        assert!(err.to_string().contains("ocm-token-refresh"));
    }
}
