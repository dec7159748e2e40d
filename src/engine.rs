//! Execution engine boundary.
//!
//! The dispatcher never executes cases or processes itself. It calls an
//! [`ExecutionEngine`] to fire listeners on running scopes and to create new
//! instances. [`InMemoryExecutionEngine`] is a reference implementation used
//! for embedded setups and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::projection::ScopeVariables;
use crate::subscription::{ScopeType, SubscriptionId};

/// Identifier of a case or process instance, as assigned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new random instance id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How an instance came to exist, when it was started by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceType {
    #[serde(rename = "event-to-case")]
    EventToCase,
    #[serde(rename = "event-to-process")]
    EventToProcess,
}

impl ReferenceType {
    #[must_use]
    pub const fn for_scope(scope_type: ScopeType) -> Self {
        match scope_type {
            ScopeType::Cmmn => Self::EventToCase,
            ScopeType::Bpmn => Self::EventToProcess,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EventToCase => "event-to-case",
            Self::EventToProcess => "event-to-process",
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to create one instance on behalf of a start subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartInstanceRequest {
    pub definition_id: String,
    pub scope_type: ScopeType,
    pub subscription_id: SubscriptionId,
    pub reference_id: String,
    pub reference_type: ReferenceType,
    /// Initial variables; visible from the moment the instance exists.
    pub variables: ScopeVariables,
}

/// A case or process instance as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeInstance {
    pub id: InstanceId,
    pub definition_id: String,
    pub scope_type: ScopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_type: Option<ReferenceType>,
    pub variables: ScopeVariables,
}

/// Downstream collaborator invoked by dispatch decisions.
///
/// Implementations handle their own per-instance synchronization.
pub trait ExecutionEngine: Send + Sync {
    /// Fires the listener on `scope_ref` with the projected payload.
    fn trigger_listener(&self, scope_ref: &str, variables: &ScopeVariables) -> Result<(), EngineError>;

    /// Creates an instance and returns its id.
    ///
    /// Must be all-or-nothing: on error no instance may remain.
    fn create_instance(&self, request: StartInstanceRequest) -> Result<InstanceId, EngineError>;

    /// Instance of `definition_id` created with `reference_id`, if one exists.
    fn find_by_reference(&self, definition_id: &str, reference_id: &str) -> Result<Option<InstanceId>, EngineError>;
}

#[derive(Debug, Default)]
struct EngineState {
    definitions: HashMap<String, ScopeType>,
    instances: Vec<ScopeInstance>,
    by_id: HashMap<InstanceId, usize>,
    triggers: HashMap<String, usize>,
}

/// Thread-safe in-memory execution engine.
///
/// Each listener trigger is counted per scope and merges the projected
/// variables into the scope, which stands in for the work a real engine would
/// schedule.
#[derive(Debug, Default)]
pub struct InMemoryExecutionEngine {
    state: RwLock<EngineState>,
}

fn lock_err(context: &'static str) -> EngineError {
    EngineError::TriggerFailed {
        scope_ref: String::new(),
        reason: format!("poisoned lock: {context}"),
    }
}

impl InMemoryExecutionEngine {
    /// Create a new empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `definition_id` known so instances can be created from it.
    pub fn deploy_definition(&self, definition_id: impl Into<String>, scope_type: ScopeType) -> Result<(), EngineError> {
        let mut state = self.state.write().map_err(|_| lock_err("engine.deploy"))?;
        state.definitions.insert(definition_id.into(), scope_type);
        Ok(())
    }

    /// Starts an instance directly, outside of event dispatch.
    pub fn start_instance(&self, definition_id: &str, variables: ScopeVariables) -> Result<InstanceId, EngineError> {
        let mut state = self.state.write().map_err(|_| lock_err("engine.start"))?;
        let Some(scope_type) = state.definitions.get(definition_id).copied() else {
            return Err(EngineError::DefinitionNotFound {
                definition_id: definition_id.to_string(),
            });
        };
        Ok(insert_instance(
            &mut state,
            ScopeInstance {
                id: InstanceId::generate(),
                definition_id: definition_id.to_string(),
                scope_type,
                reference_id: None,
                reference_type: None,
                variables,
            },
        ))
    }

    #[must_use]
    pub fn instance(&self, id: &InstanceId) -> Option<ScopeInstance> {
        let state = self.state.read().ok()?;
        state.by_id.get(id).map(|&idx| state.instances[idx].clone())
    }

    /// All instances in creation order.
    #[must_use]
    pub fn instances(&self) -> Vec<ScopeInstance> {
        self.state
            .read()
            .map(|s| s.instances.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn instances_of(&self, definition_id: &str) -> Vec<ScopeInstance> {
        self.instances()
            .into_iter()
            .filter(|i| i.definition_id == definition_id)
            .collect()
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.state.read().map(|s| s.instances.len()).unwrap_or(0)
    }

    /// Number of listener triggers delivered to `scope_ref`.
    #[must_use]
    pub fn trigger_count(&self, scope_ref: &str) -> usize {
        self.state
            .read()
            .map(|s| s.triggers.get(scope_ref).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

fn insert_instance(state: &mut EngineState, instance: ScopeInstance) -> InstanceId {
    let id = instance.id.clone();
    state.by_id.insert(id.clone(), state.instances.len());
    state.instances.push(instance);
    id
}

impl ExecutionEngine for InMemoryExecutionEngine {
    fn trigger_listener(&self, scope_ref: &str, variables: &ScopeVariables) -> Result<(), EngineError> {
        let mut state = self.state.write().map_err(|_| lock_err("engine.trigger"))?;
        let Some(idx) = state.by_id.get(&InstanceId::from(scope_ref)).copied() else {
            return Err(EngineError::ScopeNotFound {
                scope_ref: scope_ref.to_string(),
            });
        };
        state.instances[idx]
            .variables
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        *state.triggers.entry(scope_ref.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn create_instance(&self, request: StartInstanceRequest) -> Result<InstanceId, EngineError> {
        let mut state = self.state.write().map_err(|_| lock_err("engine.create"))?;
        if !state.definitions.contains_key(&request.definition_id) {
            return Err(EngineError::DefinitionNotFound {
                definition_id: request.definition_id,
            });
        }
        Ok(insert_instance(
            &mut state,
            ScopeInstance {
                id: InstanceId::generate(),
                definition_id: request.definition_id,
                scope_type: request.scope_type,
                reference_id: Some(request.reference_id),
                reference_type: Some(request.reference_type),
                variables: request.variables,
            },
        ))
    }

    fn find_by_reference(&self, definition_id: &str, reference_id: &str) -> Result<Option<InstanceId>, EngineError> {
        let state = self.state.read().map_err(|_| lock_err("engine.find_by_reference"))?;
        Ok(state
            .instances
            .iter()
            .find(|i| i.definition_id == definition_id && i.reference_id.as_deref() == Some(reference_id))
            .map(|i| i.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EventValue;

    fn request(definition_id: &str) -> StartInstanceRequest {
        let mut variables = ScopeVariables::new();
        variables.insert("customerIdVar".to_string(), EventValue::from("kermit"));
        StartInstanceRequest {
            definition_id: definition_id.to_string(),
            scope_type: ScopeType::Cmmn,
            subscription_id: SubscriptionId::new(),
            reference_id: "ref-1".to_string(),
            reference_type: ReferenceType::EventToCase,
            variables,
        }
    }

    #[test]
    fn create_requires_deployed_definition() {
        let engine = InMemoryExecutionEngine::new();
        let err = engine.create_instance(request("case-1")).unwrap_err();
        assert!(matches!(err, EngineError::DefinitionNotFound { .. }));
        assert_eq!(engine.instance_count(), 0);
    }

    #[test]
    fn created_instance_carries_reference_and_variables() {
        let engine = InMemoryExecutionEngine::new();
        engine.deploy_definition("case-1", ScopeType::Cmmn).unwrap();
        let id = engine.create_instance(request("case-1")).unwrap();

        let inst = engine.instance(&id).unwrap();
        assert_eq!(inst.reference_id.as_deref(), Some("ref-1"));
        assert_eq!(inst.reference_type, Some(ReferenceType::EventToCase));
        assert_eq!(inst.variables.get("customerIdVar"), Some(&EventValue::from("kermit")));
    }

    #[test]
    fn find_by_reference_matches_definition_and_reference() {
        let engine = InMemoryExecutionEngine::new();
        engine.deploy_definition("case-1", ScopeType::Cmmn).unwrap();
        engine.deploy_definition("case-2", ScopeType::Cmmn).unwrap();
        let id = engine.create_instance(request("case-1")).unwrap();

        assert_eq!(engine.find_by_reference("case-1", "ref-1").unwrap(), Some(id));
        assert!(engine.find_by_reference("case-2", "ref-1").unwrap().is_none());
        assert!(engine.find_by_reference("case-1", "ref-2").unwrap().is_none());
    }

    #[test]
    fn trigger_counts_and_merges_variables() {
        let engine = InMemoryExecutionEngine::new();
        engine.deploy_definition("case-1", ScopeType::Cmmn).unwrap();
        let id = engine.start_instance("case-1", ScopeVariables::new()).unwrap();

        let mut vars = ScopeVariables::new();
        vars.insert("payload1".to_string(), EventValue::from("Hello World"));
        engine.trigger_listener(id.as_str(), &vars).unwrap();
        engine.trigger_listener(id.as_str(), &ScopeVariables::new()).unwrap();

        assert_eq!(engine.trigger_count(id.as_str()), 2);
        assert_eq!(engine.instance(&id).unwrap().variables.len(), 1);
        assert!(engine.instance(&id).unwrap().reference_type.is_none());
    }

    #[test]
    fn trigger_on_unknown_scope_fails() {
        let engine = InMemoryExecutionEngine::new();
        let err = engine.trigger_listener("nope", &ScopeVariables::new()).unwrap_err();
        assert_eq!(
            err,
            EngineError::ScopeNotFound {
                scope_ref: "nope".to_string()
            }
        );
    }

    #[test]
    fn reference_type_follows_scope() {
        assert_eq!(ReferenceType::for_scope(ScopeType::Cmmn).as_str(), "event-to-case");
        assert_eq!(ReferenceType::for_scope(ScopeType::Bpmn).as_str(), "event-to-process");
        assert_eq!(
            serde_json::to_value(ReferenceType::EventToCase).unwrap(),
            serde_json::json!("event-to-case")
        );
    }
}
