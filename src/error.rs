//! Error types for corrflow.
//!
//! All errors are strongly typed using thiserror. No-match and duplicate-start
//! are dispatch outcomes, not errors, and never show up here.

use thiserror::Error;

use crate::storage::StorageError;
use crate::subscription::SubscriptionId;

/// Validation errors raised while building models, subscriptions or configs.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Event type cannot be empty")]
    EmptyEventType,

    #[error("Scope reference cannot be empty")]
    EmptyScopeRef,

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Field '{name}' is declared more than once on event type '{event_type}'")]
    DuplicateField {
        event_type: String,
        name: String,
    },

    #[error("'{name}' is not a correlation parameter of event type '{event_type}'")]
    UndeclaredCorrelationParameter {
        event_type: String,
        name: String,
    },

    #[error("Correlation parameter '{name}' expects {expected}, got {actual}")]
    CorrelationTypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("No event model registered for event type '{event_type}'")]
    UnknownEventType {
        event_type: String,
    },

    #[error("Unique instance policy is only meaningful on start subscriptions ({id})")]
    UniquePolicyOnRunningListener {
        id: SubscriptionId,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while dispatching.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Dispatch queue full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Dispatch worker disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Failures reported by the downstream execution engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Scope '{scope_ref}' not found")]
    ScopeNotFound {
        scope_ref: String,
    },

    #[error("Definition '{definition_id}' not found")]
    DefinitionNotFound {
        definition_id: String,
    },

    #[error("Instance creation failed for '{definition_id}': {reason}")]
    CreateFailed {
        definition_id: String,
        reason: String,
    },

    #[error("Listener trigger failed on '{scope_ref}': {reason}")]
    TriggerFailed {
        scope_ref: String,
        reason: String,
    },
}

/// Top-level error type for corrflow.
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for CorrelationError {
    fn from(err: StorageError) -> Self {
        Self::Execution(ExecutionError::Storage {
            message: err.to_string(),
        })
    }
}

impl CorrelationError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the downstream engine failed.
    #[must_use]
    pub const fn is_engine(&self) -> bool {
        matches!(self, Self::Engine(_))
    }

    /// Returns true if the same event may succeed when delivered again.
    ///
    /// Retrying belongs to the transport; this only classifies.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::QueueFull { .. }
            ),
            Self::Engine(e) => matches!(
                e,
                EngineError::CreateFailed { .. } | EngineError::TriggerFailed { .. }
            ),
        }
    }
}

/// Result type alias for corrflow operations.
pub type CorrelationResult<T> = Result<T, CorrelationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_undeclared_parameter() {
        let err = ValidationError::UndeclaredCorrelationParameter {
            event_type: "myEvent".to_string(),
            name: "payload1".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("payload1"));
        assert!(msg.contains("myEvent"));
    }

    #[test]
    fn execution_error_queue_full() {
        let err = ExecutionError::QueueFull { capacity: 16 };
        assert!(format!("{err}").contains("16"));
    }

    #[test]
    fn storage_error_maps_to_execution() {
        let err: CorrelationError = StorageError::BackendError("disk gone".to_string()).into();
        assert!(err.is_execution());
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn engine_error_is_retryable() {
        let err: CorrelationError = EngineError::CreateFailed {
            definition_id: "case-1".to_string(),
            reason: "boom".to_string(),
        }
        .into();
        assert!(err.is_engine());
        assert!(err.is_retryable());

        let err: CorrelationError = EngineError::DefinitionNotFound {
            definition_id: "case-1".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_error_is_not_retryable() {
        let err = CorrelationError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}
