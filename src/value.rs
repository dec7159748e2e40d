//! Typed values carried by event instances.
//!
//! Event values form a closed set of variants. Equality is defined per variant
//! and never coerces between them, so `Integer(1)` and `Double(1.0)` are
//! different values for correlation purposes.

use serde::{Deserialize, Serialize};

/// A single named value on an event instance or subscription.
///
/// # Examples
///
/// ```
/// use corrflow::EventValue;
///
/// let customer = EventValue::from("kermit");
/// let amount = EventValue::Integer(42);
///
/// assert!(customer.is_string());
/// assert_eq!(amount.as_integer(), Some(42));
/// assert_ne!(EventValue::Integer(1), EventValue::Double(1.0));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EventValue {
    String(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Json(serde_json::Value),
}

impl EventValue {
    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub const fn is_integer(&self) -> bool {
        matches!(self, Self::Integer(_))
    }

    pub const fn is_double(&self) -> bool {
        matches!(self, Self::Double(_))
    }

    pub const fn is_boolean(&self) -> bool {
        matches!(self, Self::Boolean(_))
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    /// The declared type this value conforms to.
    #[must_use]
    pub const fn payload_type(&self) -> PayloadType {
        match self {
            Self::String(_) => PayloadType::String,
            Self::Integer(_) => PayloadType::Integer,
            Self::Double(_) => PayloadType::Double,
            Self::Boolean(_) => PayloadType::Boolean,
            Self::Json(_) => PayloadType::Json,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.payload_type().name()
    }

    /// Stable byte encoding used when hashing correlation keys.
    ///
    /// The leading tag keeps `String("1")` and `Integer(1)` apart.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.payload_type().tag());
        match self {
            Self::String(v) => out.extend_from_slice(v.as_bytes()),
            Self::Integer(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            Self::Boolean(v) => out.push(u8::from(*v)),
            // serde_json maps are ordered, so this is deterministic.
            Self::Json(v) => out.extend_from_slice(v.to_string().as_bytes()),
        }
        out
    }
}

impl std::fmt::Display for EventValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v:?}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for EventValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for EventValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<i64> for EventValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for EventValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for EventValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for EventValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<serde_json::Value> for EventValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// Declared type of an event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadType {
    String,
    Integer,
    Double,
    Boolean,
    Json,
}

impl PayloadType {
    /// Whether `value` conforms to this declared type.
    #[must_use]
    pub const fn accepts(self, value: &EventValue) -> bool {
        matches!(
            (self, value),
            (Self::String, EventValue::String(_))
                | (Self::Integer, EventValue::Integer(_))
                | (Self::Double, EventValue::Double(_))
                | (Self::Boolean, EventValue::Boolean(_))
                | (Self::Json, EventValue::Json(_))
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Json => "json",
        }
    }

    const fn tag(self) -> u8 {
        match self {
            Self::String => 1,
            Self::Integer => 2,
            Self::Double => 3,
            Self::Boolean => 4,
            Self::Json => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_accessors() {
        let val = EventValue::String("kermit".to_string());
        assert!(val.is_string());
        assert_eq!(val.as_string(), Some("kermit"));
        assert_eq!(val.type_name(), "string");
    }

    #[test]
    fn integer_accessors_do_not_widen() {
        let val = EventValue::Integer(42);
        assert!(val.is_integer());
        assert_eq!(val.as_integer(), Some(42));
        // No implicit widening.
        assert_eq!(val.as_double(), None);
    }

    #[test]
    fn equality_never_coerces() {
        assert_ne!(EventValue::Integer(1), EventValue::Double(1.0));
        assert_ne!(EventValue::String("1".into()), EventValue::Integer(1));
        assert_ne!(EventValue::Boolean(true), EventValue::Integer(1));
        assert_ne!(EventValue::Double(f64::NAN), EventValue::Double(f64::NAN));
    }

    #[test]
    fn payload_type_accepts() {
        assert!(PayloadType::String.accepts(&"x".into()));
        assert!(!PayloadType::String.accepts(&EventValue::Integer(1)));
        assert!(PayloadType::Integer.accepts(&EventValue::Integer(1)));
        assert!(PayloadType::Json.accepts(&serde_json::json!({"a": 1}).into()));
    }

    #[test]
    fn canonical_bytes_distinguish_variants() {
        let s = EventValue::String("1".into()).canonical_bytes();
        let i = EventValue::Integer(1).canonical_bytes();
        assert_ne!(s, i);
        assert_eq!(s, EventValue::from("1").canonical_bytes());
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(format!("{}", EventValue::Boolean(true)), "true");
        assert_eq!(format!("{}", EventValue::Integer(42)), "42");
        assert_eq!(format!("{}", EventValue::from("hi")), "\"hi\"");
    }

    #[test]
    fn serialization_is_tagged() {
        let val = EventValue::Integer(7);
        let json = serde_json::to_value(&val).unwrap();
        assert_eq!(json, serde_json::json!({"type": "integer", "value": 7}));
        let back: EventValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, val);
    }
}
