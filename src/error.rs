//! Error types for kyro-identity.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! failure class. The boundary layer maps an [`IdentityError`] to its own
//! framing via [`IdentityError::to_failure`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Failure classes exposed to the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An underlying persistence operation failed.
    Store,
    /// An expected invariant was violated mid-operation.
    Consistency,
    /// The request carried no usable attribute.
    InvalidRequest,
    /// Lock poisoning, worker disconnects, timeouts.
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store => write!(f, "store"),
            Self::Consistency => write!(f, "consistency"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Serializable failure payload: `failure(kind, message)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Human readable cause.
    pub message: String,
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A store operation failed.
    #[error("Store failure: {0}")]
    Store(#[from] StorageError),

    /// An expected invariant did not hold mid-operation.
    #[error("Consistency failure: {message}")]
    Consistency {
        /// What was violated.
        message: String,
    },

    /// The request carried no usable attribute.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Why the request was rejected.
        message: String,
    },

    /// Lock poisoning or a failed thread spawn.
    #[error("Internal error: {message}")]
    Internal {
        /// Error details.
        message: String,
    },

    /// The repair worker queue is full.
    #[error("Repair queue is full (capacity: {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The repair worker has stopped.
    #[error("Repair worker disconnected")]
    Disconnected,

    /// Waiting on a repair run timed out.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        /// Timeout in milliseconds.
        duration_ms: u64,
    },
}

impl IdentityError {
    /// Creates a consistency failure.
    #[must_use]
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    /// Creates an invalid-request failure.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Store(_) => FailureKind::Store,
            Self::Consistency { .. } => FailureKind::Consistency,
            Self::InvalidRequest { .. } => FailureKind::InvalidRequest,
            Self::Internal { .. } | Self::QueueFull { .. } | Self::Disconnected | Self::Timeout { .. } => {
                FailureKind::Internal
            }
        }
    }

    /// Returns true if this is a store failure.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns true if this is a consistency failure.
    #[must_use]
    pub const fn is_consistency(&self) -> bool {
        matches!(self, Self::Consistency { .. })
    }

    /// Returns true if this error is retryable.
    ///
    /// Consistency failures usually clear after the next repair pass, so they
    /// count as retryable along with transient backend and queue errors.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => matches!(
                e,
                StorageError::BackendError(_) | StorageError::ConnectionError(_)
            ),
            Self::Consistency { .. } | Self::QueueFull { .. } | Self::Timeout { .. } => true,
            Self::InvalidRequest { .. } | Self::Internal { .. } | Self::Disconnected => false,
        }
    }

    /// Converts this error into the boundary-facing failure payload.
    #[must_use]
    pub fn to_failure(&self) -> IdentifyFailure {
        IdentifyFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Result type alias for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;
