//! Event instances and event-type models.
//!
//! An [`EventInstance`] is the normalized form of one received business event:
//! the upstream pipeline has already detected its type and mapped its fields.
//! An [`EventModel`] declares, per event type, which fields are correlation
//! parameters and which are payload only.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::value::{EventValue, PayloadType};

/// Identifier of one received event instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventInstanceId(Uuid);

impl EventInstanceId {
    /// Creates a new random event id.
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

impl Default for EventInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One normalized occurrence of a business event.
///
/// Immutable once built. `values` mixes correlation-relevant and payload-only
/// fields; the subscription decides which ones it looks at.
///
/// # Examples
///
/// ```
/// use corrflow::EventInstance;
///
/// let event = EventInstance::builder("myEvent")
///     .value("customerId", "kermit")
///     .value("payload2", 7)
///     .build()
///     .unwrap();
///
/// assert_eq!(event.event_type(), "myEvent");
/// assert_eq!(event.get("customerId").and_then(|v| v.as_string()), Some("kermit"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInstance {
    id: EventInstanceId,
    event_type: String,
    values: BTreeMap<String, EventValue>,
    received_at: DateTime<Utc>,
}

impl EventInstance {
    /// Creates a builder for an event of the given type.
    #[must_use]
    pub fn builder(event_type: impl Into<String>) -> EventInstanceBuilder {
        EventInstanceBuilder::new(event_type)
    }

    #[must_use]
    pub const fn id(&self) -> EventInstanceId {
        self.id
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, EventValue> {
        &self.values
    }

    /// Looks up a named value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&EventValue> {
        self.values.get(name)
    }

    #[must_use]
    pub const fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Builder for [`EventInstance`].
#[derive(Debug, Clone)]
pub struct EventInstanceBuilder {
    id: Option<EventInstanceId>,
    event_type: String,
    values: BTreeMap<String, EventValue>,
    received_at: Option<DateTime<Utc>>,
}

impl EventInstanceBuilder {
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            values: BTreeMap::new(),
            received_at: None,
        }
    }

    /// Sets the event id (generated if not set).
    #[must_use]
    pub fn id(mut self, id: EventInstanceId) -> Self {
        self.id = Some(id);
        self
    }

    /// Adds a named value. A later value with the same name replaces the earlier one.
    #[must_use]
    pub fn value(mut self, name: impl Into<String>, value: impl Into<EventValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Adds a value only when present; mirrors upstream mappers that skip null fields.
    #[must_use]
    pub fn value_opt(self, name: impl Into<String>, value: Option<impl Into<EventValue>>) -> Self {
        match value {
            Some(v) => self.value(name, v),
            None => self,
        }
    }

    #[must_use]
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    /// Builds the event instance.
    pub fn build(self) -> Result<EventInstance, ValidationError> {
        let event_type = self.event_type.trim().to_string();
        if event_type.is_empty() {
            return Err(ValidationError::EmptyEventType);
        }

        Ok(EventInstance {
            id: self.id.unwrap_or_default(),
            event_type,
            values: self.values,
            received_at: self.received_at.unwrap_or_else(Utc::now),
        })
    }
}

/// A declared `(name, type)` pair on an event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub payload_type: PayloadType,
}

/// Ordered set of correlation parameters declared on an event type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationParameterSet(Vec<FieldDefinition>);

impl CorrelationParameterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared type of a correlation parameter, if `name` is one.
    #[must_use]
    pub fn type_of(&self, name: &str) -> Option<PayloadType> {
        self.0
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.payload_type)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.type_of(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Declared shape of an event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventModel {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub correlation_parameters: CorrelationParameterSet,
    #[serde(default)]
    pub payload: Vec<FieldDefinition>,
}

impl EventModel {
    /// Creates a builder for the event type `key`.
    #[must_use]
    pub fn builder(key: impl Into<String>) -> EventModelBuilder {
        EventModelBuilder::new(key)
    }

    /// Declared type of any field, correlation parameter or payload.
    #[must_use]
    pub fn field_type(&self, name: &str) -> Option<PayloadType> {
        self.correlation_parameters.type_of(name).or_else(|| {
            self.payload
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.payload_type)
        })
    }

    /// Correlation-eligible values carried by `event`, in declaration order.
    ///
    /// Values whose type does not conform to the declaration are left out.
    #[must_use]
    pub fn correlation_values_of<'a>(&self, event: &'a EventInstance) -> Vec<(&'a str, &'a EventValue)> {
        let mut out = Vec::new();
        for param in self.correlation_parameters.iter() {
            if let Some((name, value)) = event.values.get_key_value(param.name.as_str()) {
                if param.payload_type.accepts(value) {
                    out.push((name.as_str(), value));
                }
            }
        }
        out
    }
}

/// Builder for [`EventModel`].
#[derive(Debug, Clone)]
pub struct EventModelBuilder {
    key: String,
    name: Option<String>,
    correlation_parameters: Vec<FieldDefinition>,
    payload: Vec<FieldDefinition>,
}

impl EventModelBuilder {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            correlation_parameters: Vec::new(),
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares a correlation parameter.
    #[must_use]
    pub fn correlation_parameter(mut self, name: impl Into<String>, payload_type: PayloadType) -> Self {
        self.correlation_parameters.push(FieldDefinition {
            name: name.into(),
            payload_type,
        });
        self
    }

    /// Declares a payload-only field.
    #[must_use]
    pub fn payload(mut self, name: impl Into<String>, payload_type: PayloadType) -> Self {
        self.payload.push(FieldDefinition {
            name: name.into(),
            payload_type,
        });
        self
    }

    /// Builds the model, rejecting empty keys and fields declared twice.
    pub fn build(self) -> Result<EventModel, ValidationError> {
        let key = self.key.trim().to_string();
        if key.is_empty() {
            return Err(ValidationError::EmptyEventType);
        }

        let mut seen = std::collections::HashSet::new();
        for field in self.correlation_parameters.iter().chain(self.payload.iter()) {
            if field.name.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "field name".to_string(),
                });
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ValidationError::DuplicateField {
                    event_type: key,
                    name: field.name.clone(),
                });
            }
        }

        Ok(EventModel {
            key,
            name: self.name,
            correlation_parameters: CorrelationParameterSet(self.correlation_parameters),
            payload: self.payload,
        })
    }
}
