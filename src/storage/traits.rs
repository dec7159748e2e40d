//! Abstract storage traits for corrflow.
//!
//! These traits define the contract that storage backends must implement:
//! - In-memory backends for testing and embedded use
//! - The WAL-backed persistent backend (feature `persistent`)
//! - External databases, via a transactional unique-constrained insert

use thiserror::Error;

use crate::engine::InstanceId;
use crate::ledger::{CorrelationKey, LedgerEntry};
use crate::subscription::{EventSubscription, SubscriptionId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Subscription not found.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// Ledger entry not found.
    #[error("Ledger entry not found: {0}")]
    LedgerEntryNotFound(CorrelationKey),

    /// Ledger entry already bound to an instance.
    #[error("Ledger entry {key} already bound to instance {instance_id}")]
    LedgerEntryAlreadyBound {
        key: CorrelationKey,
        instance_id: InstanceId,
    },

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Registry of correlation-capable listeners.
///
/// Reads are concurrent. Writes come from deployment collaborators, never from
/// the dispatcher. Query results are in insertion order.
pub trait SubscriptionStore: Send + Sync {
    /// Register a subscription. Returns error if the ID already exists.
    fn register(&self, subscription: EventSubscription) -> Result<(), StorageError>;

    /// Remove a subscription by ID. Returns error if not found.
    fn unregister(&self, id: SubscriptionId) -> Result<EventSubscription, StorageError>;

    /// Remove every subscription owned by `scope_ref` (instance ended or
    /// definition undeployed). Returns the removed subscriptions.
    fn unregister_scope(&self, scope_ref: &str) -> Result<Vec<EventSubscription>, StorageError>;

    /// Get a subscription by ID.
    fn get(&self, id: SubscriptionId) -> Result<Option<EventSubscription>, StorageError>;

    /// All subscriptions owned by `scope_ref`.
    fn find_by_scope(&self, scope_ref: &str) -> Result<Vec<EventSubscription>, StorageError>;

    /// Running-instance listeners for `event_type`.
    fn find_running_listeners(&self, event_type: &str) -> Result<Vec<EventSubscription>, StorageError>;

    /// Start-definition subscriptions for `event_type`.
    fn find_start_subscriptions(&self, event_type: &str) -> Result<Vec<EventSubscription>, StorageError>;

    /// Number of registered subscriptions.
    fn count(&self) -> Result<usize, StorageError>;
}

/// Durable record of instances created by unique start subscriptions.
///
/// # Atomicity
/// `insert_if_absent` must be linearizable: of any number of concurrent
/// callers with the same key, exactly one observes `true`.
pub trait ReferenceLedger: Send + Sync {
    /// Reserve `key`. Returns `false` if an entry (bound or not) already exists.
    fn insert_if_absent(&self, key: &CorrelationKey) -> Result<bool, StorageError>;

    /// Bind a reserved entry to the instance it created.
    fn bind(&self, key: &CorrelationKey, instance_id: &InstanceId) -> Result<(), StorageError>;

    /// Drop a reservation whose instance creation failed. Bound entries are kept.
    fn release(&self, key: &CorrelationKey) -> Result<(), StorageError>;

    /// Instance bound to `key`, if any.
    fn lookup(&self, key: &CorrelationKey) -> Result<Option<InstanceId>, StorageError>;

    /// Full entry for `key`, bound or reserved.
    fn entry(&self, key: &CorrelationKey) -> Result<Option<LedgerEntry>, StorageError>;

    /// Reservations not yet bound to an instance.
    fn unbound(&self) -> Result<Vec<LedgerEntry>, StorageError>;

    /// Remove an entry once its instance is permanently gone.
    fn remove(&self, key: &CorrelationKey) -> Result<Option<LedgerEntry>, StorageError>;

    /// Number of entries (bound and reserved).
    fn count(&self) -> Result<usize, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_subscription_store_object_safe(_: &dyn SubscriptionStore) {}
    fn _assert_reference_ledger_object_safe(_: &dyn ReferenceLedger) {}

    #[test]
    fn storage_error_display() {
        let err = StorageError::SubscriptionNotFound(SubscriptionId::new());
        assert!(err.to_string().contains("Subscription not found"));

        let key = CorrelationKey::compute("def", "myEvent", &[]);
        let err = StorageError::LedgerEntryAlreadyBound {
            key,
            instance_id: InstanceId::new("inst-1"),
        };
        assert!(err.to_string().contains("inst-1"));
    }
}
