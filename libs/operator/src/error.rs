use thiserror::Error;

/// Errors produced anywhere in the ingestion, rule-matching, reconciliation
/// or Git-write pipeline.
///
/// Propagation policy: within a component errors bubble up to its nearest
/// public boundary; across components they become status conditions, never
/// exceptions crossing a task boundary silently.
#[derive(Debug, Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("Kubernetes reported error: {0}")]
    KubeError(#[from] kube::Error),

    /// Git operation failure (clone, fetch, commit, push).
    #[error("git operation failed: {0}")]
    GitError(#[from] git2::Error),

    /// Failure in the `rops` SOPS-compatible encryption pipeline.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// The object fed into `Sanitize` could not be parsed or was missing
    /// required metadata.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Error in user input or CRD spec, typically missing/conflicting
    /// references.
    #[error("invalid spec: {0}")]
    UserInputError(String),

    /// Discovery of a GVR against the API server's resource catalogue failed
    /// or the GVR is not (yet) discoverable.
    #[error("discovery error: {0}")]
    DiscoveryError(String),

    /// (De)serialization of canonical YAML/JSON failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A referenced `GitProvider`/`GitTarget`/secret does not exist.
    #[error("reference not found: {0}")]
    NotFound(String),

    /// Push rejected after exhausting `maxRetries` rebase-by-reset attempts.
    #[error("push conflict not resolved after {0} retries")]
    PushConflict(u32),

    /// I/O failure talking to the local clone's filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid trace id")]
    InvalidTraceId,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse error classes driving retry/backoff policy (§7 of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reject at controller boundary; do not retry until spec changes.
    Validation,
    /// Retry with jittered exponential backoff up to a bounded envelope.
    TransientIo,
    /// Git push race, handled by rebase-by-reset; not retried beyond
    /// `maxRetries` within one batch.
    Conflict,
    /// Sanitize failure or unparseable object; dropped, never retried.
    Poison,
    /// Missing secret, bad encryption config, bad credentials.
    Configuration,
    /// Recovered panic / internal invariant violation.
    Fatal,
}

impl Error {
    /// Stable, low-cardinality label for Prometheus error counters.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube".to_string(),
            Error::GitError(_) => "git".to_string(),
            Error::EncryptionError(_) => "encryption".to_string(),
            Error::InvalidObject(_) => "invalid_object".to_string(),
            Error::UserInputError(_) => "user_input".to_string(),
            Error::DiscoveryError(_) => "discovery".to_string(),
            Error::SerializationError(_) => "serialization".to_string(),
            Error::JsonError(_) => "serialization".to_string(),
            Error::NotFound(_) => "not_found".to_string(),
            Error::PushConflict(_) => "push_conflict".to_string(),
            Error::Io(_) => "io".to_string(),
            Error::InvalidTraceId => "trace_id".to_string(),
            Error::Internal(_) => "internal".to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::UserInputError(_) | Error::NotFound(_) => ErrorClass::Validation,
            Error::KubeError(_) | Error::Io(_) | Error::DiscoveryError(_) => {
                ErrorClass::TransientIo
            }
            Error::GitError(_) | Error::PushConflict(_) => ErrorClass::Conflict,
            Error::InvalidObject(_) => ErrorClass::Poison,
            Error::EncryptionError(_) => ErrorClass::Configuration,
            Error::SerializationError(_) | Error::JsonError(_) => ErrorClass::Poison,
            Error::InvalidTraceId | Error::Internal(_) => ErrorClass::Fatal,
        }
    }

    pub fn retryable(&self) -> bool {
        !matches!(
            self.class(),
            ErrorClass::Validation | ErrorClass::Poison | ErrorClass::Configuration
        )
    }
}
