//! Reference ledger records and correlation key hashing.
//!
//! A ledger entry ties a correlation key of a unique start subscription to the
//! instance it created. The key hash is a blake3 digest over the definition,
//! the event type and the correlation values the start is deduplicated on.

use std::fmt;

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::InstanceId;
use crate::value::EventValue;

/// Ledger key: `(definition_id, event_type, correlation_key_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub definition_id: String,
    pub event_type: String,
    /// Lowercase hex blake3 digest.
    pub hash: String,
}

impl CorrelationKey {
    /// Computes the key for a matched unique start subscription.
    ///
    /// Values are hashed sorted by parameter name, so the declaration order on
    /// the subscription does not change the key.
    #[must_use]
    pub fn compute(definition_id: &str, event_type: &str, matched: &[(String, EventValue)]) -> Self {
        let mut sorted: Vec<&(String, EventValue)> = matched.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let mut h = Hasher::new();
        update_framed(&mut h, definition_id.as_bytes());
        update_framed(&mut h, event_type.as_bytes());
        for (name, value) in sorted {
            update_framed(&mut h, name.as_bytes());
            update_framed(&mut h, &value.canonical_bytes());
        }

        Self {
            definition_id: definition_id.to_string(),
            event_type: event_type.to_string(),
            hash: h.finalize().to_hex().to_string(),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.definition_id, self.event_type, self.hash)
    }
}

// Length prefix keeps ("ab","c") and ("a","bc") apart.
fn update_framed(h: &mut Hasher, bytes: &[u8]) {
    h.update(&(bytes.len() as u64).to_le_bytes());
    h.update(bytes);
}

/// One reference ledger record.
///
/// `instance_id` is `None` while the creating dispatch is still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: CorrelationKey,
    pub instance_id: Option<InstanceId>,
    pub reserved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    #[must_use]
    pub fn reserved(key: CorrelationKey) -> Self {
        Self {
            key,
            instance_id: None,
            reserved_at: Utc::now(),
            bound_at: None,
        }
    }

    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.instance_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(p: &[(&str, EventValue)]) -> Vec<(String, EventValue)> {
        p.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn key_is_deterministic() {
        let a = CorrelationKey::compute("def-1", "myEvent", &pairs(&[("customerId", "c".into())]));
        let b = CorrelationKey::compute("def-1", "myEvent", &pairs(&[("customerId", "c".into())]));
        assert_eq!(a, b);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn key_ignores_declaration_order() {
        let a = CorrelationKey::compute(
            "def-1",
            "myEvent",
            &pairs(&[("customerId", "c".into()), ("orderId", "o".into())]),
        );
        let b = CorrelationKey::compute(
            "def-1",
            "myEvent",
            &pairs(&[("orderId", "o".into()), ("customerId", "c".into())]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn key_differs_per_value_definition_and_type() {
        let base = CorrelationKey::compute("def-1", "myEvent", &pairs(&[("customerId", "c".into())]));
        let other_value = CorrelationKey::compute("def-1", "myEvent", &pairs(&[("customerId", "d".into())]));
        let other_def = CorrelationKey::compute("def-2", "myEvent", &pairs(&[("customerId", "c".into())]));
        let other_variant =
            CorrelationKey::compute("def-1", "myEvent", &pairs(&[("customerId", EventValue::Integer(1))]));
        assert_ne!(base.hash, other_value.hash);
        assert_ne!(base.hash, other_def.hash);
        assert_ne!(base.hash, other_variant.hash);
    }

    #[test]
    fn framing_prevents_boundary_collisions() {
        let a = CorrelationKey::compute("ab", "c", &[]);
        let b = CorrelationKey::compute("a", "bc", &[]);
        assert_ne!(a.hash, b.hash);
    }
}
