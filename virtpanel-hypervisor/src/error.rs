//! Error types for the hypervisor abstraction layer.

use thiserror::Error;

/// Errors that can occur during hypervisor and host network operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Domain was not found.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Storage pool was not found.
    #[error("Storage pool not found: {0}")]
    PoolNotFound(String),

    /// Storage volume was not found.
    #[error("Storage volume not found: {0}")]
    VolumeNotFound(String),

    /// Virtual network was not found.
    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    /// Snapshot not found.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Device (disk, cdrom, nic) is not attached to the domain.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// An object with the same identity already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Object is in an invalid state for the requested operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// The driver did not answer in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// General operation failed.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// True when retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::Timeout(_))
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(HypervisorError::ConnectionFailed("socket closed".into()).is_transient());
        assert!(HypervisorError::Timeout("start".into()).is_transient());
        assert!(!HypervisorError::DomainNotFound("vm".into()).is_transient());
        assert!(!HypervisorError::OperationFailed("boom".into()).is_transient());
    }
}
