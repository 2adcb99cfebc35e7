//! Kubernetes side of converge
//!
//! Wires [`converge_core`] polling to a live cluster: a dynamic resource
//! client, an artifact recorder, add-on and `oc` command clients, and wait helpers
//! that combine them with the core observers.

#![deny(missing_docs)]

pub mod addon;
pub mod artifacts;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod oc;
pub mod resource;
pub mod retry;
pub mod secret;
pub mod telemetry;
pub mod wait;

pub use addon::{AddonClient, OcmCli};
pub use artifacts::{ArtifactRecorder, DirRecorder};
pub use client::{create_client, ensure_created, KubeResourceClient, ResourceClient};
pub use config::DriverConfig;
pub use error::Error;
pub use oc::{MustGather, OcCli};
pub use resource::ResourceKind;
pub use retry::{retry_api_call, retry_with_backoff, RetryConfig};

#[cfg(test)]
pub use client::MockResourceClient;

/// Result alias for driver operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
