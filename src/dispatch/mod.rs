//! Event dispatch.
//!
//! [`DispatchCoordinator`] turns one event into listener triggers and instance
//! starts. [`DispatchRuntime`] runs the coordinator on a bounded worker pool so
//! many producers can hand off events concurrently.

mod coordinator;

/// Bounded worker pool around the coordinator.
pub mod runtime;

pub use coordinator::{DispatchCoordinator, DispatchEffect, DispatchFailure, DispatchResult, SettleReport};
pub use runtime::{DispatchHandle, DispatchRuntime};
