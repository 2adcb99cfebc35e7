//! Managed add-on service client
//!
//! Add-ons are installed through OpenShift Cluster Manager. The `ocm` CLI
//! prints the JSON response body on success and the JSON error body on
//! failure, so both paths are parsed the same way and classified by
//! [`ServiceState`].

use async_trait::async_trait;
use converge_core::observer::ServiceState;
use converge_core::{observe, poll_with, PollContext, PollSpec, Snapshot};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::artifacts::ArtifactRecorder;
use crate::command::run_command;
use crate::Error;

/// Program name of the OCM command line client
pub const OCM_PROGRAM: &str = "ocm";

/// Response `kind` of an existing add-on installation
pub const ADDON_INSTALLATION_KIND: &str = "AddOnInstallation";

/// Add-on state that means the installation finished
pub const ADDON_READY: &str = "ready";

/// Add-on states that never recover
pub const ADDON_TERMINAL_STATES: [&str; 2] = ["failed", "deleting"];

/// Access to the add-on management API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AddonClient: Send + Sync {
    /// Authenticate against the given environment
    async fn login(&self, token: &str, url: &str) -> Result<(), Error>;

    /// Fetch an add-on installation (or the error body describing why not)
    async fn get_addon(&self, cluster_id: &str, addon_id: &str) -> Result<Snapshot, Error>;

    /// Request installation of an add-on
    async fn install_addon(&self, cluster_id: &str, payload: &Snapshot) -> Result<Snapshot, Error>;
}

/// [`AddonClient`] that shells out to the `ocm` CLI
#[derive(Debug, Clone)]
pub struct OcmCli {
    program: String,
}

impl Default for OcmCli {
    fn default() -> Self {
        Self {
            program: OCM_PROGRAM.to_string(),
        }
    }
}

impl OcmCli {
    /// Use the `ocm` binary found on `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific binary
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<(bool, String), Error> {
        let out = run_command(&self.program, args, stdin).await?;
        Ok((out.success, out.output))
    }

    fn parse(&self, success: bool, output: &str) -> Result<Snapshot, Error> {
        parse_response(&self.program, success, output)
    }
}

/// Interpret `ocm` output as a JSON response body
///
/// A failed command whose output is a JSON error body is still a response:
/// its `kind` is `Error` and [`ServiceState`] keeps it pending. Anything else
/// that failed is a command error.
pub fn parse_response(program: &str, success: bool, output: &str) -> Result<Snapshot, Error> {
    match serde_json::from_str::<Snapshot>(output.trim()) {
        Ok(body) if body.is_object() => Ok(body),
        _ if success => Err(Error::serialization(format!(
            "{} returned a non-JSON response: {}",
            program,
            output.trim()
        ))),
        _ => Err(Error::command(program, output.trim())),
    }
}

fn addons_path(cluster_id: &str) -> String {
    format!("/api/clusters_mgmt/v1/clusters/{}/addons", cluster_id)
}

#[async_trait]
impl AddonClient for OcmCli {
    async fn login(&self, token: &str, url: &str) -> Result<(), Error> {
        let token_arg = format!("--token={}", token);
        let url_arg = format!("--url={}", url);
        let (success, output) = self.run(&["login", &token_arg, &url_arg], None).await?;
        if !success {
            return Err(Error::command(&self.program, output.trim()));
        }
        info!(url = %url, "Logged in to OCM");
        Ok(())
    }

    async fn get_addon(&self, cluster_id: &str, addon_id: &str) -> Result<Snapshot, Error> {
        let path = format!("{}/{}", addons_path(cluster_id), addon_id);
        let (success, output) = self.run(&["get", &path], None).await?;
        self.parse(success, &output)
    }

    async fn install_addon(&self, cluster_id: &str, payload: &Snapshot) -> Result<Snapshot, Error> {
        let path = addons_path(cluster_id);
        let body = serde_json::to_vec(payload)?;
        let (success, output) = self.run(&["post", &path], Some(&body)).await?;
        let response = self.parse(success, &output)?;
        if !success {
            return Err(Error::command(&self.program, output.trim()));
        }
        Ok(response)
    }
}

/// Whether a `get_addon` response describes an existing installation
pub fn is_installed(response: &Snapshot) -> bool {
    response.get("kind").and_then(|k| k.as_str()) == Some(ADDON_INSTALLATION_KIND)
}

/// Install request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddonPayload {
    /// Add-on to install
    pub addon: AddonRef,
    /// Installation parameters
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<AddonParameter>,
}

/// Reference to an add-on by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddonRef {
    /// Add-on id (e.g. "nvidia-gpu-addon")
    pub id: String,
}

/// One installation parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddonParameter {
    /// Parameter id
    pub id: String,
    /// Parameter value
    pub value: String,
}

impl AddonPayload {
    /// Payload installing `addon_id` with no parameters
    pub fn new(addon_id: impl Into<String>) -> Self {
        Self {
            addon: AddonRef { id: addon_id.into() },
            parameters: Vec::new(),
        }
    }

    /// Add an installation parameter
    pub fn with_parameter(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(AddonParameter {
            id: id.into(),
            value: value.into(),
        });
        self
    }

    /// The request body as JSON
    pub fn to_snapshot(&self) -> Result<Snapshot, Error> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Wait for an add-on to report `ready`
///
/// `failed` and `deleting` stop the wait immediately. The last response seen
/// is recorded as `addon-<id>-ocm-response.json` whether or not the wait
/// succeeded; a failed write is logged and does not change the result.
pub async fn wait_for_addon(
    client: &dyn AddonClient,
    recorder: &dyn ArtifactRecorder,
    spec: &PollSpec,
    ctx: &PollContext,
    cluster_id: &str,
    addon_id: &str,
) -> Result<Snapshot, Error> {
    let observer = ServiceState::new(ADDON_READY).failing_on(ADDON_TERMINAL_STATES);
    let last: Mutex<Option<Snapshot>> = Mutex::new(None);

    let result = poll_with(spec, ctx, || async {
        let response = client.get_addon(cluster_id, addon_id).await;
        if let Ok(body) = &response {
            *last.lock().await = Some(body.clone());
        }
        observe(response, &observer)
    })
    .await;

    let outcome = result.into_result();
    let last = last.into_inner().unwrap_or(Snapshot::Null);
    if let Err(e) = recorder
        .record_json(&format!("addon-{}-ocm-response.json", addon_id), &last)
        .await
    {
        warn!(addon = %addon_id, error = %e, "Failed to record add-on response");
    }

    outcome?;
    Ok(last)
}
