//! # corrflow - Event Correlation for Case and Process Engines
//!
//! corrflow decides, for each inbound business event, which listeners on
//! running instances fire and whether new instances must be started. It sits
//! between the event transport and the execution engine.
//!
//! ## Core Concepts
//!
//! - **EventInstance**: a normalized event, an event type plus named typed values
//! - **EventSubscription**: a listener on a running instance or an instance-starting definition
//! - **Correlation**: exact, per-variant equality over the subscription's expected values
//! - **Reference ledger**: the atomic record that enforces one instance per correlation key
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use corrflow::{DispatchCoordinator, EventInstance, EventSubscription, InMemoryExecutionEngine, InMemoryStores};
//!
//! let stores = InMemoryStores::new();
//! let engine = Arc::new(InMemoryExecutionEngine::new());
//! let coordinator = DispatchCoordinator::new(
//!     Arc::new(stores.subscriptions),
//!     Arc::new(stores.ledger),
//!     engine.clone(),
//! );
//!
//! coordinator.register_subscription(
//!     EventSubscription::start_definition("myEvent", "case-1")
//!         .correlate("customerId", "kermit")
//!         .unique_instance(true)
//!         .build()?,
//! )?;
//!
//! let event = EventInstance::builder("myEvent").value("customerId", "kermit").build()?;
//! let result = coordinator.dispatch(&event)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod event;
pub mod ledger;
pub mod subscription;
pub mod value;

// Correlation
pub mod matcher;
pub mod projection;
pub mod registry;

// Boundaries and dispatch
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use config::{DispatchConfig, DispatchRuntimeConfig};
pub use dispatch::{
    DispatchCoordinator, DispatchEffect, DispatchFailure, DispatchHandle, DispatchResult, DispatchRuntime,
    SettleReport,
};
pub use engine::{
    ExecutionEngine, InMemoryExecutionEngine, InstanceId, ReferenceType, ScopeInstance, StartInstanceRequest,
};
pub use error::{CorrelationError, CorrelationResult, EngineError, ExecutionError, ValidationError};
pub use event::{
    CorrelationParameterSet, EventInstance, EventInstanceBuilder, EventInstanceId, EventModel, EventModelBuilder,
    FieldDefinition,
};
pub use ledger::{CorrelationKey, LedgerEntry};
pub use matcher::{matches, CorrelationMatcher, MatchOutput, MatchedCorrelation, NoMatchReason};
pub use projection::{project, ScopeVariables};
pub use registry::EventRegistry;
pub use storage::{
    InMemoryReferenceLedger, InMemoryStores, InMemorySubscriptionStore, ReferenceLedger, StorageError,
    SubscriptionStore,
};
pub use subscription::{EventSubscription, ScopeType, SubscriptionBuilder, SubscriptionId, SubscriptionKind};
pub use value::{EventValue, PayloadType};
