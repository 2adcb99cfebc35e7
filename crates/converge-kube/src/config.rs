//! Driver configuration
//!
//! Built once by the CLI from flags with environment fallbacks and passed to
//! every step. Nothing below the CLI reads the environment.

use std::path::PathBuf;

use converge_core::ConvergeError;

/// Default working namespace for the GPU operator
pub const DEFAULT_NAMESPACE: &str = "nvidia-gpu-operator";

/// Default artifact directory
pub const DEFAULT_ARTIFACT_DIR: &str = "/tmp/gpu-test";

/// Default AWS instance type for GPU workers
pub const DEFAULT_GPU_INSTANCE_TYPE: &str = "g4dn.xlarge";

/// Default number of GPU workers
pub const DEFAULT_GPU_REPLICAS: u32 = 1;

/// Settings shared by every driver step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Namespace the operator is installed into
    pub namespace: String,
    /// Operator channel to subscribe to (package default when unset)
    pub operator_channel: Option<String>,
    /// Kubeconfig path (in-cluster or default config when unset)
    pub kubeconfig: Option<PathBuf>,
    /// Where artifacts are written
    pub artifact_dir: PathBuf,
    /// Instance type of the GPU MachineSet
    pub gpu_instance_type: String,
    /// Replica count for the GPU MachineSet
    pub gpu_replicas: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            operator_channel: None,
            kubeconfig: None,
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            gpu_instance_type: DEFAULT_GPU_INSTANCE_TYPE.to_string(),
            gpu_replicas: DEFAULT_GPU_REPLICAS,
        }
    }
}

impl DriverConfig {
    /// Reject settings no step can work with
    pub fn validate(&self) -> Result<(), ConvergeError> {
        if self.namespace.trim().is_empty() {
            return Err(ConvergeError::validation("namespace", "must not be empty"));
        }
        if self.gpu_instance_type.trim().is_empty() {
            return Err(ConvergeError::validation(
                "gpu_instance_type",
                "must not be empty",
            ));
        }
        if self.operator_channel.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(ConvergeError::validation(
                "operator_channel",
                "must not be blank when set",
            ));
        }
        Ok(())
    }
}
