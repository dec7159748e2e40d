//! Dispatch coordinator.
//!
//! Each event runs two independent passes over the subscription store:
//!
//! 1. Running listeners: every matching listener fires once with the
//!    projected payload. There is no dedup across events.
//! 2. Start subscriptions: every match starts an instance. When the
//!    subscription enforces uniqueness, the correlation key is reserved in the
//!    reference ledger first and a lost reservation becomes a duplicate skip.
//!
//! A downstream failure on one subscription is recorded in the result and does
//! not stop the others.
//!
//! The correlation key of a unique start covers every declared correlation
//! parameter the event carries, so one subscription keyed on `customerId`
//! starts one instance per customer. Without a registered model only the
//! subscription's own matched values count.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, trace, warn};

use crate::config::DispatchConfig;
use crate::engine::{ExecutionEngine, InstanceId, ReferenceType, StartInstanceRequest};
use crate::error::{CorrelationError, CorrelationResult, ValidationError};
use crate::event::{EventInstance, EventInstanceId};
use crate::ledger::CorrelationKey;
use crate::matcher::{CorrelationMatcher, MatchOutput, MatchedCorrelation};
use crate::projection::{project, ScopeVariables};
use crate::registry::EventRegistry;
use crate::storage::{ReferenceLedger, SubscriptionStore};
use crate::subscription::{EventSubscription, SubscriptionId};
use crate::value::EventValue;

/// One decision taken for one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum DispatchEffect {
    /// A running listener fired.
    Triggered {
        subscription_id: SubscriptionId,
        scope_ref: String,
    },
    /// A start subscription created an instance.
    Created {
        subscription_id: SubscriptionId,
        definition_id: String,
        instance_id: InstanceId,
        reference_id: String,
    },
    /// A unique start subscription found its correlation key already taken.
    SkippedDuplicate {
        subscription_id: SubscriptionId,
        definition_id: String,
        key: CorrelationKey,
        /// Bound instance, if the winning dispatch has finished binding.
        existing_instance: Option<InstanceId>,
    },
}

/// A subscription whose trigger or start failed downstream.
#[derive(Debug)]
pub struct DispatchFailure {
    pub subscription_id: SubscriptionId,
    pub scope_ref: String,
    pub error: CorrelationError,
}

/// Everything one dispatch did.
#[derive(Debug)]
pub struct DispatchResult {
    pub event_id: EventInstanceId,
    pub event_type: String,
    /// Effects in pass order: listener triggers first, then starts.
    pub effects: Vec<DispatchEffect>,
    pub failures: Vec<DispatchFailure>,
}

impl DispatchResult {
    fn new(event: &EventInstance) -> Self {
        Self {
            event_id: event.id(),
            event_type: event.event_type().to_string(),
            effects: Vec::new(),
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn triggered_count(&self) -> usize {
        self.effects
            .iter()
            .filter(|e| matches!(e, DispatchEffect::Triggered { .. }))
            .count()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        self.effects
            .iter()
            .filter(|e| matches!(e, DispatchEffect::Created { .. }))
            .count()
    }

    #[must_use]
    pub fn skipped_count(&self) -> usize {
        self.effects
            .iter()
            .filter(|e| matches!(e, DispatchEffect::SkippedDuplicate { .. }))
            .count()
    }

    /// Instances created by this dispatch, in creation order.
    #[must_use]
    pub fn created_instances(&self) -> Vec<&InstanceId> {
        self.effects
            .iter()
            .filter_map(|e| match e {
                DispatchEffect::Created { instance_id, .. } => Some(instance_id),
                _ => None,
            })
            .collect()
    }

    /// True when no subscription matched and nothing failed.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.effects.is_empty() && self.failures.is_empty()
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Turns the first recorded failure into an `Err`.
    ///
    /// Effects of the other subscriptions have already happened either way.
    pub fn into_result(mut self) -> CorrelationResult<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        Err(self.failures.swap_remove(0).error)
    }
}

/// Correlates events against the subscription store and drives the engine.
///
/// Stores and engine are shared trait objects, so one coordinator can be used
/// from many threads at once.
pub struct DispatchCoordinator {
    subscriptions: Arc<dyn SubscriptionStore>,
    ledger: Arc<dyn ReferenceLedger>,
    engine: Arc<dyn ExecutionEngine>,
    registry: Arc<EventRegistry>,
    config: DispatchConfig,
}

impl DispatchCoordinator {
    /// Create a coordinator with an empty registry and the default config.
    #[must_use]
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        ledger: Arc<dyn ReferenceLedger>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            engine,
            registry: Arc::new(EventRegistry::new()),
            config: DispatchConfig::default(),
        }
    }

    /// Share an existing event registry.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<EventRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn subscriptions(&self) -> &Arc<dyn SubscriptionStore> {
        &self.subscriptions
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn ReferenceLedger> {
        &self.ledger
    }

    /// Validate `subscription` against the registry and store it.
    pub fn register_subscription(&self, subscription: EventSubscription) -> CorrelationResult<SubscriptionId> {
        if self.config.strict_models && self.registry.get(&subscription.event_type)?.is_none() {
            return Err(ValidationError::UnknownEventType {
                event_type: subscription.event_type,
            }
            .into());
        }
        self.registry.validate_subscription(&subscription)?;

        let id = subscription.id;
        debug!(
            subscription_id = %id,
            event_type = %subscription.event_type,
            scope_ref = %subscription.scope_ref,
            kind = ?subscription.kind,
            "subscription registered"
        );
        self.subscriptions.register(subscription)?;
        Ok(id)
    }

    /// Drop every subscription owned by an ended instance or undeployed definition.
    pub fn unregister_scope(&self, scope_ref: &str) -> CorrelationResult<Vec<EventSubscription>> {
        let removed = self.subscriptions.unregister_scope(scope_ref)?;
        debug!(scope_ref, removed = removed.len(), "scope subscriptions removed");
        Ok(removed)
    }

    /// Dispatch one event.
    ///
    /// Returns `Err` only when the subscription store or registry cannot be
    /// read; per-subscription failures land in [`DispatchResult::failures`].
    pub fn dispatch(&self, event: &EventInstance) -> CorrelationResult<DispatchResult> {
        let span = info_span!("dispatch", event_type = %event.event_type(), event_id = %event.id());
        let _enter = span.enter();

        let model = self.registry.get(event.event_type())?;
        let matcher = CorrelationMatcher::new(model.as_ref());
        let mut result = DispatchResult::new(event);

        for sub in self.subscriptions.find_running_listeners(event.event_type())? {
            if !self.is_match(&matcher, &sub, event) {
                continue;
            }
            let variables = project(&sub.payload_mapping, event.values());
            match self.engine.trigger_listener(&sub.scope_ref, &variables) {
                Ok(()) => {
                    debug!(subscription_id = %sub.id, scope_ref = %sub.scope_ref, "listener triggered");
                    result.effects.push(DispatchEffect::Triggered {
                        subscription_id: sub.id,
                        scope_ref: sub.scope_ref,
                    });
                }
                Err(e) => record_failure(&mut result, &sub, e.into()),
            }
        }

        let starts = self.subscriptions.find_start_subscriptions(event.event_type())?;
        let declared = if starts.iter().any(EventSubscription::enforces_uniqueness) {
            self.registry.correlation_values_of(event)?
        } else {
            None
        };
        for sub in starts {
            let matched = match matcher.evaluate(&sub, event) {
                MatchOutput::Match(matched) => matched,
                MatchOutput::NoMatch(reason) => {
                    trace!(subscription_id = %sub.id, ?reason, "no match");
                    continue;
                }
            };
            let variables = project(&sub.payload_mapping, event.values());
            let outcome = if sub.enforces_uniqueness() {
                let key = CorrelationKey::compute(
                    &sub.scope_ref,
                    &sub.event_type,
                    &key_values(&matched, declared.as_deref()),
                );
                self.start_unique(&sub, key, variables)
            } else {
                self.start(&sub, sub.id.to_string(), variables)
            };
            match outcome {
                Ok(effect) => result.effects.push(effect),
                Err(e) => record_failure(&mut result, &sub, e),
            }
        }

        debug!(
            triggered = result.triggered_count(),
            created = result.created_count(),
            skipped = result.skipped_count(),
            failed = result.failures.len(),
            "dispatch finished"
        );
        Ok(result)
    }

    fn is_match(&self, matcher: &CorrelationMatcher<'_>, sub: &EventSubscription, event: &EventInstance) -> bool {
        match matcher.evaluate(sub, event) {
            MatchOutput::Match(_) => true,
            MatchOutput::NoMatch(reason) => {
                trace!(subscription_id = %sub.id, ?reason, "no match");
                false
            }
        }
    }

    fn start(
        &self,
        sub: &EventSubscription,
        reference_id: String,
        variables: ScopeVariables,
    ) -> CorrelationResult<DispatchEffect> {
        let request = StartInstanceRequest {
            definition_id: sub.scope_ref.clone(),
            scope_type: sub.scope_type,
            subscription_id: sub.id,
            reference_id: reference_id.clone(),
            reference_type: ReferenceType::for_scope(sub.scope_type),
            variables,
        };
        let instance_id = self.engine.create_instance(request)?;
        debug!(
            subscription_id = %sub.id,
            definition_id = %sub.scope_ref,
            instance_id = %instance_id,
            "instance created"
        );
        Ok(DispatchEffect::Created {
            subscription_id: sub.id,
            definition_id: sub.scope_ref.clone(),
            instance_id,
            reference_id,
        })
    }

    fn start_unique(
        &self,
        sub: &EventSubscription,
        key: CorrelationKey,
        variables: ScopeVariables,
    ) -> CorrelationResult<DispatchEffect> {
        if !self.ledger.insert_if_absent(&key)? {
            let existing_instance = self.ledger.lookup(&key)?;
            debug!(
                subscription_id = %sub.id,
                key = %key,
                existing_instance = ?existing_instance,
                "duplicate start skipped"
            );
            return Ok(DispatchEffect::SkippedDuplicate {
                subscription_id: sub.id,
                definition_id: sub.scope_ref.clone(),
                key,
                existing_instance,
            });
        }

        let effect = match self.start(sub, key.hash.clone(), variables) {
            Ok(effect) => effect,
            Err(e) => {
                if let Err(release_err) = self.ledger.release(&key) {
                    warn!(key = %key, error = %release_err, "failed to release reservation");
                }
                return Err(e);
            }
        };

        // The instance exists even if bind fails; keep the reservation.
        if let DispatchEffect::Created { instance_id, .. } = &effect {
            if let Err(e) = self.ledger.bind(&key, instance_id) {
                warn!(
                    key = %key,
                    instance_id = %instance_id,
                    error = %e,
                    "instance created but reservation left unbound"
                );
                return Err(e.into());
            }
        }
        Ok(effect)
    }

    /// Settle reservations left unbound by an interrupted or failed dispatch.
    ///
    /// Each unbound key is looked up in the engine by its reference id: an
    /// existing instance gets bound, otherwise the reservation is released.
    /// Run this before events are dispatched; a reservation held by an
    /// in-flight dispatch would be released too.
    pub fn settle_reservations(&self) -> CorrelationResult<SettleReport> {
        let mut report = SettleReport::default();
        for entry in self.ledger.unbound()? {
            let key = entry.key;
            match self.engine.find_by_reference(&key.definition_id, &key.hash)? {
                Some(instance_id) => {
                    self.ledger.bind(&key, &instance_id)?;
                    info!(key = %key, instance_id = %instance_id, "unbound reservation bound to existing instance");
                    report.bound.push((key, instance_id));
                }
                None => {
                    self.ledger.release(&key)?;
                    info!(key = %key, "unbound reservation released");
                    report.released.push(key);
                }
            }
        }
        Ok(report)
    }
}

/// Outcome of [`DispatchCoordinator::settle_reservations`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleReport {
    /// Keys whose instance was found and recorded.
    pub bound: Vec<(CorrelationKey, InstanceId)>,
    /// Keys with no instance; free for a later event.
    pub released: Vec<CorrelationKey>,
}

impl SettleReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty() && self.released.is_empty()
    }
}

/// Values a unique start is deduplicated on: every declared correlation
/// parameter the event carries, plus the values the subscription matched.
fn key_values(
    matched: &MatchedCorrelation,
    declared: Option<&[(String, EventValue)]>,
) -> Vec<(String, EventValue)> {
    let mut values: BTreeMap<String, EventValue> = declared.unwrap_or_default().iter().cloned().collect();
    values.extend(matched.values.iter().cloned());
    values.into_iter().collect()
}

impl std::fmt::Debug for DispatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCoordinator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn record_failure(result: &mut DispatchResult, sub: &EventSubscription, error: CorrelationError) {
    warn!(
        subscription_id = %sub.id,
        scope_ref = %sub.scope_ref,
        error = %error,
        "subscription dispatch failed"
    );
    result.failures.push(DispatchFailure {
        subscription_id: sub.id,
        scope_ref: sub.scope_ref.clone(),
        error,
    });
}
