//! Registry of declared event types.
//!
//! The registry holds one [`EventModel`] per event type. Subscriptions are
//! validated against it before they reach a store, and the matcher consults it
//! to reject values whose type does not match the declaration.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{CorrelationError, CorrelationResult, ValidationError};
use crate::event::{EventInstance, EventModel};
use crate::subscription::EventSubscription;
use crate::value::EventValue;

/// Thread-safe event-type registry.
#[derive(Debug, Default)]
pub struct EventRegistry {
    models: RwLock<HashMap<String, EventModel>>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the model for `model.key`.
    pub fn register(&self, model: EventModel) -> CorrelationResult<()> {
        let mut models = self
            .models
            .write()
            .map_err(|_| CorrelationError::internal("poisoned lock: registry.register"))?;
        tracing::debug!(event_type = %model.key, "event model registered");
        models.insert(model.key.clone(), model);
        Ok(())
    }

    /// Removes a model; returns it if it existed.
    pub fn unregister(&self, key: &str) -> CorrelationResult<Option<EventModel>> {
        let mut models = self
            .models
            .write()
            .map_err(|_| CorrelationError::internal("poisoned lock: registry.unregister"))?;
        Ok(models.remove(key))
    }

    pub fn get(&self, key: &str) -> CorrelationResult<Option<EventModel>> {
        let models = self
            .models
            .read()
            .map_err(|_| CorrelationError::internal("poisoned lock: registry.get"))?;
        Ok(models.get(key).cloned())
    }

    /// Checks that every correlation key of `sub` is a declared correlation
    /// parameter of its event type and that expected values conform.
    ///
    /// Subscriptions on event types without a registered model pass unchecked.
    pub fn validate_subscription(&self, sub: &EventSubscription) -> CorrelationResult<()> {
        let Some(model) = self.get(&sub.event_type)? else {
            return Ok(());
        };

        for (name, expected) in &sub.correlation_values {
            let Some(declared) = model.correlation_parameters.type_of(name) else {
                return Err(ValidationError::UndeclaredCorrelationParameter {
                    event_type: sub.event_type.clone(),
                    name: name.clone(),
                }
                .into());
            };
            if !declared.accepts(expected) {
                return Err(ValidationError::CorrelationTypeMismatch {
                    name: name.clone(),
                    expected: declared.name(),
                    actual: expected.type_name(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Correlation-eligible values carried by `event`, in declaration order.
    ///
    /// Returns `None` when no model is registered for the event type.
    pub fn correlation_values_of(&self, event: &EventInstance) -> CorrelationResult<Option<Vec<(String, EventValue)>>> {
        let models = self
            .models
            .read()
            .map_err(|_| CorrelationError::internal("poisoned lock: registry.correlation_values_of"))?;
        Ok(models.get(event.event_type()).map(|model| {
            model
                .correlation_values_of(event)
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect()
        }))
    }
}
