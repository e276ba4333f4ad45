//! Structured errors and the sanitized failure record regions keep in state.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses into shared context or onto the bus.**
//!
//! - `anyhow` is internal transport for collaborator calls (scene graph, HDR
//!   loader, persistence)
//! - [`ServiceFailure`] is the only externalized failure: a category plus a
//!   message that is safe to show in snapshots
//! - [`SyncError`] is returned from the public API and is pattern-matchable
//!
//! # Example
//!
//! ```ignore
//! match coordinator.snapshot().context.environment.last_error {
//!     Some(ServiceFailure { category: ErrorCategory::ResourceExhaustion, .. }) => {
//!         // circuit is open; RETRY after the reset timeout
//!     }
//!     Some(failure) => tracing::warn!(%failure, "environment failed"),
//!     None => {}
//! }
//! ```

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::breaker::CircuitOpenError;
use crate::security::SecurityLevel;

// =============================================================================
// Error Category
// =============================================================================

/// Classification that drives how a region recovers from a failure.
///
/// - `Validation`: recovered locally by clamping, never reaches `Error`
/// - `ServiceFailure`: region moves to `Error`, operator may `RETRY`
/// - `TransitionConflict`: security request rejected, state unchanged
/// - `ResourceExhaustion`: a circuit breaker is open
/// - `Fatal`: rendering context lost, region halts until restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Validation,
    ServiceFailure,
    TransitionConflict,
    ResourceExhaustion,
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation_error"),
            ErrorCategory::ServiceFailure => write!(f, "service_failure"),
            ErrorCategory::TransitionConflict => write!(f, "transition_conflict"),
            ErrorCategory::ResourceExhaustion => write!(f, "resource_exhaustion"),
            ErrorCategory::Fatal => write!(f, "fatal"),
        }
    }
}

// =============================================================================
// Categorizable Trait
// =============================================================================

/// Errors that know their recovery category and a message safe to expose.
pub trait Categorizable: std::error::Error {
    fn category(&self) -> ErrorCategory;

    /// Must not leak collaborator internals (paths, driver messages).
    fn safe_message(&self) -> Cow<'static, str>;
}

// =============================================================================
// Sync Error
// =============================================================================

/// Errors returned by the coordinator and the render-sync service.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("transition to {requested} rejected: transition to {in_progress} still running")]
    TransitionBusy {
        requested: SecurityLevel,
        in_progress: SecurityLevel,
    },

    #[error("coordinator has been disposed")]
    Disposed,

    #[error("render sync is not running")]
    NotRunning,

    #[error("storage backend error: {0:#}")]
    Storage(anyhow::Error),

    #[error("failed to encode or decode {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint {id} failed digest verification")]
    CorruptCheckpoint { id: Uuid },

    #[error("checkpoint {id} not found")]
    CheckpointNotFound { id: Uuid },
}

impl Categorizable for SyncError {
    fn category(&self) -> ErrorCategory {
        match self {
            SyncError::CircuitOpen(_) => ErrorCategory::ResourceExhaustion,
            SyncError::TransitionBusy { .. } => ErrorCategory::TransitionConflict,
            SyncError::Disposed | SyncError::NotRunning => ErrorCategory::Validation,
            SyncError::Storage(_)
            | SyncError::Serialization { .. }
            | SyncError::CorruptCheckpoint { .. }
            | SyncError::CheckpointNotFound { .. } => ErrorCategory::ServiceFailure,
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            SyncError::CircuitOpen(_) => "Operation temporarily unavailable".into(),
            SyncError::TransitionBusy { .. } => "Security transition busy".into(),
            SyncError::Disposed => "Coordinator disposed".into(),
            SyncError::NotRunning => "Synchronization not running".into(),
            _ => "Persistence failure".into(),
        }
    }
}

/// Raised by collaborators when the rendering context is gone.
///
/// Regions that receive it halt instead of entering a retryable `Error`.
#[derive(Debug, Error)]
#[error("rendering context lost: {reason}")]
pub struct RenderContextLost {
    pub reason: String,
}

impl Categorizable for RenderContextLost {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Fatal
    }

    fn safe_message(&self) -> Cow<'static, str> {
        "Rendering context lost".into()
    }
}

// =============================================================================
// Service Failure
// =============================================================================

/// Sanitized failure recorded in a region's state and published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl ServiceFailure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Categorize and sanitize a collaborator error.
    ///
    /// Known error types are downcast in order of specificity; anything else
    /// becomes a generic `ServiceFailure`. The raw error is for logs only.
    pub fn from_error(error: &anyhow::Error) -> Self {
        if let Some(e) = error.downcast_ref::<RenderContextLost>() {
            return Self::new(e.category(), e.safe_message());
        }
        if let Some(e) = error.downcast_ref::<SyncError>() {
            return Self::new(e.category(), e.safe_message());
        }
        if let Some(e) = error.downcast_ref::<CircuitOpenError>() {
            return Self::circuit_open(e);
        }
        if let Some(io_err) = error.downcast_ref::<std::io::Error>() {
            return match io_err.kind() {
                std::io::ErrorKind::NotFound => {
                    Self::new(ErrorCategory::ServiceFailure, "Resource not found")
                }
                std::io::ErrorKind::PermissionDenied => {
                    Self::new(ErrorCategory::ServiceFailure, "Access denied")
                }
                _ => Self::new(ErrorCategory::ServiceFailure, "I/O failure"),
            };
        }

        // Never error.to_string() here; collaborator messages can carry paths.
        Self::new(ErrorCategory::ServiceFailure, "External service failed")
    }

    pub fn circuit_open(error: &CircuitOpenError) -> Self {
        Self::new(
            ErrorCategory::ResourceExhaustion,
            format!("{} circuit open", error.operation),
        )
    }

    pub fn is_fatal(&self) -> bool {
        self.category == ErrorCategory::Fatal
    }
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
