//! Artifact recording
//!
//! CI runs keep the resources and logs they observed so that a failure can be
//! inspected after the cluster is gone. Recording never influences whether a
//! wait converges; a caller that needs the artifact propagates the error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use converge_core::Snapshot;
use tracing::{debug, warn};

use crate::Error;

/// Sink for named artifacts
#[async_trait]
pub trait ArtifactRecorder: Send + Sync {
    /// Store a JSON document under `name` (pretty-printed)
    async fn record_json(&self, name: &str, value: &Snapshot) -> Result<(), Error>;

    /// Store plain text under `name`
    async fn record_text(&self, name: &str, text: &str) -> Result<(), Error>;
}

/// Writes artifacts as files into a directory, creating it on first use
#[derive(Debug, Clone)]
pub struct DirRecorder {
    dir: PathBuf,
}

impl DirRecorder {
    /// Record into `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The artifact directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path an artifact name maps to
    ///
    /// Path separators in the name are flattened so every artifact lands
    /// directly in the artifact directory.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name.replace(['/', '\\'], "_"))
    }

    async fn write(&self, name: &str, contents: &[u8]) -> Result<(), Error> {
        let path = self.path_for(name);
        let result = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, contents).await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(path = %path.display(), bytes = contents.len(), "Recorded artifact");
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to record artifact");
                Err(Error::artifact(path.display().to_string(), e.to_string()))
            }
        }
    }
}

#[async_trait]
impl ArtifactRecorder for DirRecorder {
    async fn record_json(&self, name: &str, value: &Snapshot) -> Result<(), Error> {
        let body = serde_json::to_vec_pretty(value)?;
        self.write(name, &body).await
    }

    async fn record_text(&self, name: &str, text: &str) -> Result<(), Error> {
        self.write(name, text.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_json_and_text_into_nested_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let recorder = DirRecorder::new(tmp.path().join("gpu-test"));

        recorder
            .record_json("gpu_operator_csv.json", &json!({"status": {"phase": "Succeeded"}}))
            .await
            .unwrap();
        recorder
            .record_text("gpu_burn_pod_logs_gpu-burn-abc.log", "GPU 0: OK\n")
            .await
            .unwrap();

        let csv = std::fs::read_to_string(recorder.path_for("gpu_operator_csv.json")).unwrap();
        let parsed: Snapshot = serde_json::from_str(&csv).unwrap();
        assert_eq!(parsed["status"]["phase"], "Succeeded");

        let log = std::fs::read_to_string(recorder.dir().join("gpu_burn_pod_logs_gpu-burn-abc.log"))
            .unwrap();
        assert_eq!(log, "GPU 0: OK\n");
    }

    #[test]
    fn names_cannot_escape_the_directory() {
        let recorder = DirRecorder::new("/tmp/gpu-test");
        assert_eq!(
            recorder.path_for("../etc/passwd"),
            PathBuf::from("/tmp/gpu-test/.._etc_passwd")
        );
    }

    #[tokio::test]
    async fn unwritable_directory_is_an_artifact_error() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let recorder = DirRecorder::new(&blocker);
        let err = recorder.record_text("x.log", "data").await.unwrap_err();
        assert!(matches!(err, Error::Artifact { .. }));
    }
}
