//! Error types for the driver side of converge
//!
//! Errors carry the resource kind, name and operation involved so that a
//! failed CI run can be diagnosed from its log alone.

use converge_core::ConvergeError;
use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for client, recorder and wait operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A poll or barrier gave up
    #[error(transparent)]
    Converge(#[from] ConvergeError),

    /// A resource the caller required does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "ClusterServiceVersion")
        kind: String,
        /// Resource name or selector description
        name: String,
    },

    /// Writing an artifact failed
    #[error("artifact error for {path}: {message}")]
    Artifact {
        /// Destination path
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// An external command failed
    #[error("command {program} failed: {message}")]
    Command {
        /// Program that was run (e.g. "ocm")
        program: String,
        /// Combined output or spawn error
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Operation where the error occurred (e.g. "create_client")
        context: String,
    },
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an artifact error
    pub fn artifact(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Artifact {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a command error
    pub fn command(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error means the resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::NotFound { .. } => true,
            _ => false,
        }
    }

    /// Whether a create failed because the resource already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409
        )
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes 4xx responses and malformed payloads need a fix, not a
    /// retry. Command failures are retried since the remote side may still be
    /// settling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Converge(e) => e.is_retryable(),
            Error::NotFound { .. } => false,
            Error::Artifact { .. } => false,
            Error::Serialization { .. } => false,
            Error::Command { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
