//! GPU operator CI driver
//!
//! Every subcommand is one CI step run against the cluster in `KUBECONFIG`.
//! Waits are bounded by fixed attempt budgets and every interesting object is
//! recorded into the artifact directory.

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use converge_core::PollContext;
use converge_kube::config::{
    DEFAULT_ARTIFACT_DIR, DEFAULT_GPU_INSTANCE_TYPE, DEFAULT_GPU_REPLICAS, DEFAULT_NAMESPACE,
};
use converge_kube::telemetry::{LogFormat, TelemetryConfig};
use converge_kube::{
    create_client, DirRecorder, DriverConfig, KubeResourceClient, OcCli, OcmCli,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use commands::StepContext;

/// converge - GPU operator CI driver
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Namespace the GPU operator is installed into
    #[arg(long, global = true, env = "WORKING_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Operator channel (package default when unset)
    #[arg(long, global = true, env = "GPU_CHANNEL")]
    pub operator_channel: Option<String>,

    /// Path to kubeconfig file
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Directory receiving recorded artifacts
    #[arg(long, global = true, env = "ARTIFACT_DIR", default_value = DEFAULT_ARTIFACT_DIR)]
    pub artifact_dir: PathBuf,

    /// Instance type for GPU workers
    #[arg(long, global = true, env = "GPU_INSTANCE_TYPE", default_value = DEFAULT_GPU_INSTANCE_TYPE)]
    pub gpu_instance_type: String,

    /// Number of GPU workers
    #[arg(long, global = true, env = "GPU_REPLICAS", default_value_t = DEFAULT_GPU_REPLICAS)]
    pub gpu_replicas: u32,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

/// Log line format flag
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the cluster is reachable and record its versions
    CheckConnection(commands::check_connection::CheckConnectionArgs),
    /// Subscribe to the NFD operator and create an NFD instance
    DeployNfd(commands::deploy_nfd::DeployNfdArgs),
    /// Wait for the NFD operator and its node annotations
    WaitNfd(commands::wait_nfd::WaitNfdArgs),
    /// Subscribe to the GPU operator and create its ClusterPolicy
    DeployOperator(commands::deploy_operator::DeployOperatorArgs),
    /// Wait for the GPU operator, GPU nodes and the validator
    WaitOperator(commands::wait_operator::WaitOperatorArgs),
    /// Ensure a GPU MachineSet with the requested replicas
    ScaleGpuNodes(commands::scale_gpu_nodes::ScaleGpuNodesArgs),
    /// Run gpu-burn on all GPU nodes
    GpuBurn(commands::gpu_burn::GpuBurnArgs),
    /// Check the operator's metrics exposure
    OperatorMetrics(commands::operator_metrics::OperatorMetricsArgs),
    /// Install the managed GPU add-on through OCM
    InstallAddon(commands::install_addon::InstallAddonArgs),
    /// Run must-gather for the GPU add-on
    AddonMustGather(commands::addon_must_gather::AddonMustGatherArgs),
}

impl Cli {
    /// Telemetry settings for this invocation
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            format: self.log_format.into(),
            filter: None,
        }
    }

    /// Driver settings from flags and environment
    pub fn driver_config(&self) -> Result<DriverConfig> {
        let config = DriverConfig {
            namespace: self.namespace.clone(),
            operator_channel: self.operator_channel.clone(),
            kubeconfig: self.kubeconfig.clone(),
            artifact_dir: self.artifact_dir.clone(),
            gpu_instance_type: self.gpu_instance_type.clone(),
            gpu_replicas: self.gpu_replicas,
        };
        config.validate()?;
        Ok(config)
    }

    /// Run the CLI command, stopping waits early once `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = self.driver_config()?;
        commands::check_connection::check_kubeconfig(config.kubeconfig.as_deref())?;
        let client = create_client(config.kubeconfig.as_deref()).await?;
        info!(
            namespace = %config.namespace,
            artifact_dir = %config.artifact_dir.display(),
            "Connected to cluster"
        );

        let recorder = DirRecorder::new(&config.artifact_dir);
        let ctx = StepContext::new(
            config,
            Arc::new(KubeResourceClient::new(client)),
            Arc::new(recorder),
        )
        .with_poll_context(PollContext::new().with_cancellation(cancel));

        match self.command {
            Commands::CheckConnection(args) => commands::check_connection::run(&ctx, &args).await,
            Commands::DeployNfd(args) => commands::deploy_nfd::run(&ctx, &args).await,
            Commands::WaitNfd(args) => commands::wait_nfd::run(&ctx, &args).await,
            Commands::DeployOperator(args) => commands::deploy_operator::run(&ctx, &args).await,
            Commands::WaitOperator(args) => commands::wait_operator::run(&ctx, &args).await,
            Commands::ScaleGpuNodes(args) => commands::scale_gpu_nodes::run(&ctx, &args).await,
            Commands::GpuBurn(args) => commands::gpu_burn::run(&ctx, &args).await,
            Commands::OperatorMetrics(args) => commands::operator_metrics::run(&ctx, &args).await,
            Commands::InstallAddon(args) => {
                commands::install_addon::run(&ctx, &OcmCli::new(), &args).await
            }
            Commands::AddonMustGather(args) => {
                commands::addon_must_gather::run(&ctx, &OcCli::new(), &args).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "converge",
            "scale-gpu-nodes",
            "--gpu-instance-type",
            "p3.2xlarge",
            "--gpu-replicas",
            "2",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::ScaleGpuNodes(_)));
        let config = cli.driver_config().unwrap();
        assert_eq!(config.gpu_instance_type, "p3.2xlarge");
        assert_eq!(config.gpu_replicas, 2);
        assert_eq!(cli.telemetry().format, LogFormat::Json);
    }

    #[test]
    fn subcommand_args_have_defaults() {
        let cli = Cli::try_parse_from(["converge", "gpu-burn", "--image", "quay.io/me/gpu-burn:dev"])
            .unwrap();
        match cli.command {
            Commands::GpuBurn(args) => {
                assert_eq!(args.burn_namespace, "gpu-burn-test");
                assert_eq!(args.image, "quay.io/me/gpu-burn:dev");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn blank_namespace_is_rejected() {
        let cli = Cli::try_parse_from(["converge", "--namespace", " ", "wait-operator"]).unwrap();
        let err = cli.driver_config().unwrap_err();
        assert!(err.to_string().contains("namespace"));
    }

    #[test]
    fn scaling_to_zero_is_allowed() {
        let cli = Cli::try_parse_from(["converge", "scale-gpu-nodes", "--gpu-replicas", "0"]).unwrap();
        assert_eq!(cli.driver_config().unwrap().gpu_replicas, 0);
    }

    #[test]
    fn nfd_and_connection_subcommands_parse() {
        let cli = Cli::try_parse_from(["converge", "deploy-nfd", "--cr-name", "nfd-ci"]).unwrap();
        match cli.command {
            Commands::DeployNfd(args) => {
                assert_eq!(args.cr_name, "nfd-ci");
                assert_eq!(args.package, "nfd");
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(matches!(
            Cli::try_parse_from(["converge", "wait-nfd"]).unwrap().command,
            Commands::WaitNfd(_)
        ));
        assert!(matches!(
            Cli::try_parse_from(["converge", "check-connection"]).unwrap().command,
            Commands::CheckConnection(_)
        ));
        assert!(matches!(
            Cli::try_parse_from(["converge", "addon-must-gather"]).unwrap().command,
            Commands::AddonMustGather(_)
        ));
    }

    #[test]
    fn unknown_subcommand_fails() {
        assert!(Cli::try_parse_from(["converge", "deploy-rhods"]).is_err());
    }
}
