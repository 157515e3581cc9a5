//! Error taxonomy of the control-plane core.
//!
//! Every error names the entity it concerns and, where relevant, the
//! operation that was attempted, so an API layer can render a specific
//! message. [`CoreError::is_retryable`] separates transient failures from
//! permanent ones.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use virtpanel_hypervisor::HypervisorError;

/// Kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Vm,
    Disk,
    Nic,
    Iso,
    Snapshot,
    Pool,
    Volume,
    Network,
    PortForward,
    /// The hypervisor host as a whole
    Host,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Vm => "vm",
            EntityKind::Disk => "disk",
            EntityKind::Nic => "nic",
            EntityKind::Iso => "iso",
            EntityKind::Snapshot => "snapshot",
            EntityKind::Pool => "pool",
            EntityKind::Volume => "volume",
            EntityKind::Network => "network",
            EntityKind::PortForward => "port forward",
            EntityKind::Host => "host",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Invalid,
    DriverFailure,
    Unavailable,
    Cancelled,
    Persistence,
}

/// Errors returned by every core operation.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Referenced entity does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },

    /// Invariant violation: duplicate identity, entity still referenced,
    /// or an operation not allowed in the current state.
    #[error("cannot {operation} {kind} '{id}': {reason}")]
    Conflict {
        kind: EntityKind,
        id: String,
        operation: String,
        reason: String,
    },

    /// Malformed input.
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// The hypervisor or host network rejected the call.
    #[error("{operation} of {kind} '{id}' failed: {source}")]
    DriverFailure {
        kind: EntityKind,
        id: String,
        operation: String,
        #[source]
        source: HypervisorError,
    },

    /// Transient failure; the caller may retry.
    #[error("{operation} of {kind} '{id}' unavailable: {reason}")]
    Unavailable {
        kind: EntityKind,
        id: String,
        operation: String,
        reason: String,
    },

    /// The caller stopped waiting. The driver call may still complete.
    #[error("{operation} of {kind} '{id}' cancelled")]
    Cancelled {
        kind: EntityKind,
        id: String,
        operation: String,
    },

    /// Durable state could not be read or written.
    #[error("failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(
        kind: EntityKind,
        id: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unavailable(
        kind: EntityKind,
        id: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unavailable {
            kind,
            id: id.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn cancelled(kind: EntityKind, id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Cancelled {
            kind,
            id: id.into(),
            operation: operation.into(),
        }
    }

    /// Map a driver error onto the taxonomy.
    ///
    /// Transient driver errors become `Unavailable`; "not found" errors
    /// become `NotFound` for the entity kind they name; the rest are wrapped
    /// as `DriverFailure`.
    pub fn from_driver(
        kind: EntityKind,
        id: impl Into<String>,
        operation: impl Into<String>,
        source: HypervisorError,
    ) -> Self {
        let id = id.into();
        if source.is_transient() {
            return Self::unavailable(kind, id, operation, source.to_string());
        }

        let missing = match &source {
            HypervisorError::DomainNotFound(_) if kind == EntityKind::Vm => {
                Some((EntityKind::Vm, id.clone()))
            }
            HypervisorError::PoolNotFound(name) => Some((EntityKind::Pool, name.clone())),
            HypervisorError::VolumeNotFound(name) => Some((EntityKind::Volume, name.clone())),
            HypervisorError::NetworkNotFound(name) => Some((EntityKind::Network, name.clone())),
            HypervisorError::SnapshotNotFound(name) => Some((EntityKind::Snapshot, name.clone())),
            _ => None,
        };

        match missing {
            Some((kind, id)) => Self::not_found(kind, id),
            None => Self::DriverFailure {
                kind,
                id,
                operation: operation.into(),
                source,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Invalid { .. } => ErrorKind::Invalid,
            Self::DriverFailure { .. } => ErrorKind::DriverFailure,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Persistence { .. } => ErrorKind::Persistence,
        }
    }

    /// True when the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
