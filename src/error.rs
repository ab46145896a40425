//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by mesh-ops operations.
#[derive(Error, Debug)]
pub enum MeshopsError {
    /// A precondition on caller-supplied data failed before any GPU work began.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The target mesh is missing attributes an operation requires.
    #[error("mesh is missing required attributes: {0}")]
    MissingAttributes(String),

    /// A GPU buffer or pipeline could not be created.
    #[error("resource creation failed: {0}")]
    ResourceCreationFailed(String),

    /// A command stream referenced a resource slot with no bound buffer.
    #[error("resource slot {0} is not bound")]
    UnboundResource(u32),

    /// Triangle-selection growth produced an inconsistent result.
    #[error("mesh topology is inconsistent: {0}")]
    TopologyInconsistency(String),

    /// The decimation algorithm reported a failure.
    #[error("decimation algorithm failed: {0}")]
    Algorithm(String),

    /// A backend submission or readback failed.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MeshopsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MeshopsError::UnboundResource(7);
        assert_eq!(err.to_string(), "resource slot 7 is not bound");

        let err = MeshopsError::TopologyInconsistency("empty selection".to_string());
        assert_eq!(
            err.to_string(),
            "mesh topology is inconsistent: empty selection"
        );
    }
}
