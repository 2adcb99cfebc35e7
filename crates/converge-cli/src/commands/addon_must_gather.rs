//! Collect must-gather data for the GPU add-on
//!
//! The must-gather image is whatever the add-on's CSV lists under
//! `spec.relatedImages`, so the data matches the installed add-on version.

use clap::Args;
use converge_core::Snapshot;
use converge_kube::MustGather;
use tracing::info;

use super::{find_operator_csv, name_of, str_at, StepContext};
use crate::{Error, Result};

/// CSV name prefix of the GPU add-on
pub const GPU_ADDON_PACKAGE: &str = "nvidia-gpu-addon";

/// `relatedImages` entry naming the must-gather image
pub const MUST_GATHER_IMAGE_NAME: &str = "must-gather";

/// Run must-gather for the GPU add-on
#[derive(Args, Debug, Clone)]
pub struct AddonMustGatherArgs {
    /// Substring identifying the add-on CSV
    #[arg(long, default_value = GPU_ADDON_PACKAGE)]
    pub package: String,
}

impl Default for AddonMustGatherArgs {
    fn default() -> Self {
        Self {
            package: GPU_ADDON_PACKAGE.to_string(),
        }
    }
}

/// Run the must-gather step, writing its data into the artifact directory
pub async fn run(ctx: &StepContext, oc: &dyn MustGather, args: &AddonMustGatherArgs) -> Result<()> {
    let csv = find_operator_csv(ctx, &args.package).await?;
    ctx.record_json("gpu-addon-csv.json", &csv).await?;

    let image = must_gather_image(&csv).ok_or_else(|| {
        Error::step_failed(
            "must-gather",
            format!(
                "must-gather image not found in {}",
                name_of(&csv).unwrap_or_default()
            ),
        )
    })?;
    info!(image = %image, "Running add-on must-gather");

    let output = oc.must_gather(image, &ctx.config.artifact_dir).await?;
    ctx.record_text("oc-must-gather-output.txt", &output).await
}

/// Image of the `must-gather` entry in a CSV's `spec.relatedImages`
pub fn must_gather_image(csv: &Snapshot) -> Option<&str> {
    csv.pointer("/spec/relatedImages")?
        .as_array()?
        .iter()
        .find(|image| str_at(image, "/name") == Some(MUST_GATHER_IMAGE_NAME))
        .and_then(|image| str_at(image, "/image"))
}
