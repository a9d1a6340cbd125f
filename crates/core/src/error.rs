//! Error types for localgate-core

use thiserror::Error;

/// Result type alias for localgate-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for localgate-core
///
/// Errors are `Clone` so that a single failed spawn can be handed to every
/// caller that was waiting on the same in-flight load.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No stored config and no usable model file for the identifier
    #[error("Config not found for model: {0}")]
    ConfigNotFound(String),

    /// A stored or derived config failed validation
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Worker process could not be started or reached
    #[error("Failed to spawn backend {backend}: {reason}")]
    BackendSpawnFailed {
        /// Backend tag that was being launched
        backend: String,
        /// Underlying cause
        reason: String,
    },

    /// Worker process is up but rejected or failed the `Load` call
    #[error("Failed to load model {0}: {1}")]
    LoadFailed(String, String),

    /// An inference operation failed inside the worker
    #[error("Prediction failed: {0}")]
    PredictFailed(String),

    /// The caller's deadline expired before the worker answered
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The RPC channel or the worker process is gone
    #[error("Connection to worker lost: {0}")]
    ConnectionLost(String),

    /// The backend type does not implement the requested capability
    #[error("Backend {backend} does not support {operation}")]
    UnsupportedOperation {
        /// Backend tag
        backend: String,
        /// Operation name
        operation: &'static str,
    },

    /// Monitor/admin call for a model with no live worker
    #[error("No running worker for model: {0}")]
    NotRunning(String),

    /// Unclassified RPC status from the worker
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl Error {
    /// Whether a naive retry of the whole request may succeed.
    ///
    /// `ConnectionLost` evicts the dead worker, so the retry spawns a fresh
    /// one; `Timeout` leaves the worker usable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConnectionLost(_) | Error::Timeout(_))
    }

    /// Map a worker RPC status into the gateway taxonomy.
    ///
    /// `op_failed` builds the operation-specific failure for statuses that
    /// are not transport problems. `deadline` is the budget the call was
    /// sent with, reported when the worker gives up on it.
    pub(crate) fn from_status(
        status: tonic::Status,
        backend: &str,
        operation: &'static str,
        deadline: Option<std::time::Duration>,
        op_failed: impl FnOnce(String) -> Error,
    ) -> Error {
        use tonic::Code;
        match status.code() {
            Code::Unavailable | Code::Cancelled | Code::Aborted => {
                Error::ConnectionLost(status.message().to_string())
            }
            Code::DeadlineExceeded => Error::Timeout(deadline.unwrap_or_default()),
            Code::Unimplemented => Error::UnsupportedOperation {
                backend: backend.to_string(),
                operation,
            },
            _ => op_failed(status.message().to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::ConnectionLost("eof".into()).is_retryable());
        assert!(Error::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!Error::ConfigNotFound("x".into()).is_retryable());
        assert!(!Error::PredictFailed("bad".into()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        let err = Error::from_status(
            tonic::Status::unavailable("socket closed"),
            "llama-cpp",
            "predict",
            None,
            Error::PredictFailed,
        );
        assert!(matches!(err, Error::ConnectionLost(_)));

        let err = Error::from_status(
            tonic::Status::unimplemented("nope"),
            "piper",
            "predict",
            None,
            Error::PredictFailed,
        );
        assert!(matches!(
            err,
            Error::UnsupportedOperation { operation: "predict", .. }
        ));

        let err = Error::from_status(
            tonic::Status::internal("cuda oom"),
            "llama-cpp",
            "predict",
            None,
            Error::PredictFailed,
        );
        assert!(matches!(err, Error::PredictFailed(msg) if msg == "cuda oom"));

        let err = Error::from_status(
            tonic::Status::deadline_exceeded("too slow"),
            "llama-cpp",
            "predict",
            Some(std::time::Duration::from_millis(1500)),
            Error::PredictFailed,
        );
        assert!(matches!(err, Error::Timeout(d) if d == std::time::Duration::from_millis(1500)));
    }
}
