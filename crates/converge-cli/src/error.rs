//! Error types for the CLI

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] converge_kube::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("telemetry error: {0}")]
    Telemetry(#[from] converge_kube::telemetry::TelemetryError),

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{step} failed: {message}")]
    StepFailed { step: String, message: String },
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub fn step_failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::StepFailed {
            step: step.into(),
            message: message.into(),
        }
    }
}

impl From<converge_core::ConvergeError> for Error {
    fn from(e: converge_core::ConvergeError) -> Self {
        Error::Driver(e.into())
    }
}
