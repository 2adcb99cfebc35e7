//! OpenShift `oc` client
//!
//! Only must-gather needs the `oc` binary; everything else goes through the
//! API server directly.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::command::run_command;
use crate::Error;

/// Program name of the OpenShift command line client
pub const OC_PROGRAM: &str = "oc";

/// Collects diagnostic data from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MustGather: Send + Sync {
    /// Run must-gather with `image`, writing into `dest_dir`, and return the command output
    async fn must_gather(&self, image: &str, dest_dir: &Path) -> Result<String, Error>;
}

/// [`MustGather`] that shells out to `oc adm must-gather`
#[derive(Debug, Clone)]
pub struct OcCli {
    program: String,
}

impl Default for OcCli {
    fn default() -> Self {
        Self {
            program: OC_PROGRAM.to_string(),
        }
    }
}

impl OcCli {
    /// Use the `oc` binary found on `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific binary
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Arguments for `oc adm must-gather`
pub fn must_gather_args(image: &str, dest_dir: &Path) -> Vec<String> {
    vec![
        "adm".to_string(),
        "must-gather".to_string(),
        format!("--image={}", image),
        format!("--dest-dir={}", dest_dir.display()),
    ]
}

#[async_trait]
impl MustGather for OcCli {
    async fn must_gather(&self, image: &str, dest_dir: &Path) -> Result<String, Error> {
        let args = must_gather_args(image, dest_dir);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = run_command(&self.program, &args, None).await?;
        if !out.success {
            return Err(Error::command(&self.program, out.output.trim()));
        }
        info!(image = %image, dest_dir = %dest_dir.display(), "must-gather finished");
        Ok(out.output)
    }
}
