//! Dispatch configuration.
//!
//! Configs are plain structs with `Default` and `validate()`. [`DispatchConfig`]
//! can also be loaded from JSON; omitted fields take their defaults.

use serde::{Deserialize, Serialize};

use crate::error::{CorrelationResult, ValidationError};

#[cfg(feature = "persistent")]
pub use crate::storage::persistent::PersistentConfig;

/// Worker pool settings for [`crate::dispatch::DispatchRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchRuntimeConfig {
    /// Number of dispatch worker threads.
    pub workers: usize,
    /// Maximum queued events before `submit` reports backpressure.
    pub queue_capacity: usize,
}

impl Default for DispatchRuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

impl DispatchRuntimeConfig {
    pub fn validate(self) -> CorrelationResult<Self> {
        if self.workers == 0 {
            return Err(invalid("runtime.workers must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("runtime.queue_capacity must be at least 1"));
        }
        Ok(self)
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Reject subscriptions whose event type has no registered model.
    pub strict_models: bool,
    pub runtime: DispatchRuntimeConfig,
}

impl DispatchConfig {
    pub fn validate(self) -> CorrelationResult<Self> {
        let runtime = self.runtime.validate()?;
        Ok(Self { runtime, ..self })
    }

    /// Parses and validates a JSON config document.
    pub fn from_json_str(json: &str) -> CorrelationResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("malformed dispatch config: {e}"),
        })?;
        cfg.validate()
    }
}

fn invalid(reason: &str) -> crate::error::CorrelationError {
    ValidationError::InvalidConfig {
        reason: reason.to_string(),
    }
    .into()
}
