//! Error types for the build operator

use thiserror::Error;

use crate::crd::BuildPhase;
use crate::resolver::ResolveError;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// A queue key that is not of the form `namespace/name`
    #[error("invalid resource key {0:?}")]
    InvalidKey(String),

    /// A phase change that the transition table forbids
    #[error("invalid phase transition {namespace}/{name}: {from} -> {to}")]
    InvalidTransition {
        namespace: String,
        name: String,
        from: BuildPhase,
        to: BuildPhase,
    },

    /// Pod spec construction failed in a way no retry can fix
    #[error("fatal pod spec error: {0}")]
    FatalPodSpec(String),

    /// Pod spec construction failed for a reason that may clear up
    #[error("pod spec error: {0}")]
    PodSpec(String),

    /// A `valueFrom` environment reference could not be resolved
    #[error("cannot resolve environment variable references: {0}")]
    EnvVarResolution(String),

    /// The build's service account has no docker secret to push or pull with
    #[error("no docker secrets associated with build service account {namespace}/{service_account}")]
    MissingDockerSecret {
        namespace: String,
        service_account: String,
    },

    /// Image reference resolution failure
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Reconciliation error
    #[error("{0}")]
    Reconciliation(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The informer caches never became ready
    #[error("timed out waiting for caches to sync")]
    CacheSyncFailed,
}

impl OperatorError {
    /// Fatal errors are never retried; the queue forgets the key immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OperatorError::FatalPodSpec(_))
    }
}

/// True when a Kubernetes API error is a 404 NotFound.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True when a Kubernetes API error is a 409 AlreadyExists.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    })
}
