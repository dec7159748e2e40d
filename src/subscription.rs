//! Event subscriptions: the listeners the dispatcher correlates against.
//!
//! A subscription is immutable once built. It either belongs to a running
//! instance (fires on matching events) or to a definition (starts new
//! instances on matching events).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::value::EventValue;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a subscription is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// Listener on an already-created instance; `scope_ref` is the instance id.
    RunningInstance,
    /// Instance-starting definition; `scope_ref` is the definition id.
    StartDefinition,
}

/// Which execution engine owns the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Bpmn,
    #[default]
    Cmmn,
}

/// One correlation-capable listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub event_type: String,
    pub kind: SubscriptionKind,
    pub scope_ref: String,
    #[serde(default)]
    pub scope_type: ScopeType,
    /// Ordered `(parameter, expected value)` pairs; empty matches on event type alone.
    #[serde(default)]
    pub correlation_values: Vec<(String, EventValue)>,
    #[serde(default)]
    pub unique_instance_policy: bool,
    /// Ordered `(event field, variable name)` pairs.
    #[serde(default)]
    pub payload_mapping: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
}

impl EventSubscription {
    /// Builder for a listener on a running instance.
    #[must_use]
    pub fn running_listener(
        event_type: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> SubscriptionBuilder {
        SubscriptionBuilder::new(SubscriptionKind::RunningInstance, event_type, instance_id)
    }

    /// Builder for an instance-starting definition.
    #[must_use]
    pub fn start_definition(
        event_type: impl Into<String>,
        definition_id: impl Into<String>,
    ) -> SubscriptionBuilder {
        SubscriptionBuilder::new(SubscriptionKind::StartDefinition, event_type, definition_id)
    }

    #[must_use]
    pub fn is_start(&self) -> bool {
        self.kind == SubscriptionKind::StartDefinition
    }

    /// True when this start subscription must dedup through the reference ledger.
    #[must_use]
    pub fn enforces_uniqueness(&self) -> bool {
        self.is_start() && self.unique_instance_policy
    }
}

/// Builder for [`EventSubscription`].
#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    id: Option<SubscriptionId>,
    kind: SubscriptionKind,
    event_type: String,
    scope_ref: String,
    scope_type: ScopeType,
    correlation_values: Vec<(String, EventValue)>,
    unique_instance_policy: bool,
    payload_mapping: Vec<(String, String)>,
}

impl SubscriptionBuilder {
    fn new(kind: SubscriptionKind, event_type: impl Into<String>, scope_ref: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            event_type: event_type.into(),
            scope_ref: scope_ref.into(),
            scope_type: ScopeType::default(),
            correlation_values: Vec::new(),
            unique_instance_policy: false,
            payload_mapping: Vec::new(),
        }
    }

    /// Sets the subscription ID (optional, will be generated if not set).
    #[must_use]
    pub fn id(mut self, id: SubscriptionId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn scope_type(mut self, scope_type: ScopeType) -> Self {
        self.scope_type = scope_type;
        self
    }

    /// Requires `name` to equal `expected` on matching events.
    ///
    /// Declaring the same parameter twice keeps the last expected value.
    #[must_use]
    pub fn correlate(mut self, name: impl Into<String>, expected: impl Into<EventValue>) -> Self {
        let name = name.into();
        let expected = expected.into();
        if let Some(slot) = self.correlation_values.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = expected;
        } else {
            self.correlation_values.push((name, expected));
        }
        self
    }

    #[must_use]
    pub fn unique_instance(mut self, unique: bool) -> Self {
        self.unique_instance_policy = unique;
        self
    }

    /// Maps `event_field` onto the scope variable `variable`.
    #[must_use]
    pub fn map_payload(mut self, event_field: impl Into<String>, variable: impl Into<String>) -> Self {
        self.payload_mapping.push((event_field.into(), variable.into()));
        self
    }

    /// Builds the subscription.
    pub fn build(self) -> Result<EventSubscription, ValidationError> {
        let event_type = self.event_type.trim().to_string();
        if event_type.is_empty() {
            return Err(ValidationError::EmptyEventType);
        }
        let scope_ref = self.scope_ref.trim().to_string();
        if scope_ref.is_empty() {
            return Err(ValidationError::EmptyScopeRef);
        }

        let id = self.id.unwrap_or_default();
        if self.unique_instance_policy && self.kind == SubscriptionKind::RunningInstance {
            return Err(ValidationError::UniquePolicyOnRunningListener { id });
        }

        Ok(EventSubscription {
            id,
            event_type,
            kind: self.kind,
            scope_ref,
            scope_type: self.scope_type,
            correlation_values: self.correlation_values,
            unique_instance_policy: self.unique_instance_policy,
            payload_mapping: self.payload_mapping,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_kind_and_scope() {
        let sub = EventSubscription::start_definition("myEvent", "case-def-1")
            .scope_type(ScopeType::Cmmn)
            .correlate("customerId", "testCustomer")
            .unique_instance(true)
            .build()
            .unwrap();

        assert!(sub.is_start());
        assert!(sub.enforces_uniqueness());
        assert_eq!(sub.scope_ref, "case-def-1");
        assert_eq!(sub.correlation_values.len(), 1);
    }

    #[test]
    fn correlate_same_parameter_twice_keeps_last() {
        let sub = EventSubscription::running_listener("myEvent", "inst-1")
            .correlate("customerId", "kermit")
            .correlate("customerId", "gonzo")
            .build()
            .unwrap();
        assert_eq!(
            sub.correlation_values,
            vec![("customerId".to_string(), EventValue::from("gonzo"))]
        );
    }

    #[test]
    fn unique_policy_rejected_on_running_listener() {
        let err = EventSubscription::running_listener("myEvent", "inst-1")
            .unique_instance(true)
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::UniquePolicyOnRunningListener { .. }));
    }

    #[test]
    fn blank_scope_rejected() {
        let err = EventSubscription::running_listener("myEvent", " ")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::EmptyScopeRef));
    }

    #[test]
    fn subscription_serde_roundtrip_defaults() {
        let json = serde_json::json!({
            "id": Uuid::nil(),
            "event_type": "myEvent",
            "kind": "start_definition",
            "scope_ref": "def-1",
            "created_at": "2024-01-01T00:00:00Z"
        });
        let sub: EventSubscription = serde_json::from_value(json).unwrap();
        assert!(sub.correlation_values.is_empty());
        assert!(!sub.unique_instance_policy);
        assert_eq!(sub.scope_type, ScopeType::Cmmn);
    }
}
