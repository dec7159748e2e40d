//! Correlation matching.
//!
//! A subscription matches an event when every declared correlation value is
//! present on the event and equal to the expected value. Absence is always a
//! non-match, extra event fields never disqualify, and an empty correlation
//! set matches on event type alone.

use serde::{Deserialize, Serialize};

use crate::event::{EventInstance, EventModel};
use crate::subscription::EventSubscription;
use crate::value::EventValue;

/// Why a subscription did not match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoMatchReason {
    EventTypeMismatch,
    MissingParameter { name: String },
    ValueMismatch { name: String },
    /// The event carried a value of the wrong declared type (malformed event).
    TypeMismatch { name: String },
}

/// Correlation values that were satisfied, in subscription order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchedCorrelation {
    pub values: Vec<(String, EventValue)>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutput {
    NoMatch(NoMatchReason),
    Match(MatchedCorrelation),
}

impl MatchOutput {
    #[must_use]
    pub const fn is_match(&self) -> bool {
        matches!(self, Self::Match(_))
    }
}

/// Evaluates subscriptions against one event.
///
/// When the event type has a registered model, correlation values whose type
/// does not conform to the declaration count as a non-match.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationMatcher<'a> {
    model: Option<&'a EventModel>,
}

impl<'a> CorrelationMatcher<'a> {
    #[must_use]
    pub const fn new(model: Option<&'a EventModel>) -> Self {
        Self { model }
    }

    pub fn evaluate(&self, sub: &EventSubscription, event: &EventInstance) -> MatchOutput {
        if sub.event_type != event.event_type() {
            return MatchOutput::NoMatch(NoMatchReason::EventTypeMismatch);
        }

        let mut matched = MatchedCorrelation {
            values: Vec::with_capacity(sub.correlation_values.len()),
        };

        for (name, expected) in &sub.correlation_values {
            let Some(actual) = event.get(name) else {
                return MatchOutput::NoMatch(NoMatchReason::MissingParameter { name: name.clone() });
            };

            if let Some(declared) = self.model.and_then(|m| m.correlation_parameters.type_of(name)) {
                if !declared.accepts(actual) {
                    return MatchOutput::NoMatch(NoMatchReason::TypeMismatch { name: name.clone() });
                }
            }

            if actual != expected {
                return MatchOutput::NoMatch(NoMatchReason::ValueMismatch { name: name.clone() });
            }
            matched.values.push((name.clone(), actual.clone()));
        }

        MatchOutput::Match(matched)
    }
}

/// Whether `sub`'s correlation values are satisfied by `event`.
///
/// Event type equality is the caller's concern; this only checks values.
#[must_use]
pub fn matches(sub: &EventSubscription, event: &EventInstance) -> bool {
    sub.correlation_values
        .iter()
        .all(|(name, expected)| event.get(name).is_some_and(|actual| actual == expected))
}
