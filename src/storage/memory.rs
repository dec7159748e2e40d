//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.
//! The arena and ledger table here are also the in-memory indices of the
//! persistent backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

use chrono::Utc;

use crate::engine::InstanceId;
use crate::ledger::{CorrelationKey, LedgerEntry};
use crate::storage::traits::{ReferenceLedger, StorageError, SubscriptionStore};
use crate::subscription::{EventSubscription, SubscriptionId, SubscriptionKind};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Subscription table with secondary indices.
///
/// Every insert takes the next sequence number; indices hold sequence numbers,
/// so query results keep insertion order and removed entries free their memory.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionArena {
    next_seq: u64,
    slots: BTreeMap<u64, EventSubscription>,
    by_id: HashMap<SubscriptionId, u64>,
    by_type_kind: HashMap<(String, SubscriptionKind), BTreeSet<u64>>,
    by_scope: HashMap<String, BTreeSet<u64>>,
}

impl SubscriptionArena {
    pub(crate) fn insert(&mut self, sub: EventSubscription) -> Result<(), StorageError> {
        if self.by_id.contains_key(&sub.id) {
            return Err(StorageError::DuplicateKey(sub.id.to_string()));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(sub.id, seq);
        self.by_type_kind
            .entry((sub.event_type.clone(), sub.kind))
            .or_default()
            .insert(seq);
        self.by_scope.entry(sub.scope_ref.clone()).or_default().insert(seq);
        self.slots.insert(seq, sub);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Result<EventSubscription, StorageError> {
        let seq = self
            .by_id
            .remove(&id)
            .ok_or(StorageError::SubscriptionNotFound(id))?;
        let sub = self
            .slots
            .remove(&seq)
            .ok_or_else(|| StorageError::BackendError(format!("subscription index out of sync: {id}")))?;

        let type_key = (sub.event_type.clone(), sub.kind);
        if let Some(set) = self.by_type_kind.get_mut(&type_key) {
            set.remove(&seq);
            if set.is_empty() {
                self.by_type_kind.remove(&type_key);
            }
        }
        if let Some(set) = self.by_scope.get_mut(&sub.scope_ref) {
            set.remove(&seq);
            if set.is_empty() {
                self.by_scope.remove(&sub.scope_ref);
            }
        }
        Ok(sub)
    }

    pub(crate) fn scope_ids(&self, scope_ref: &str) -> Vec<SubscriptionId> {
        self.collect(self.by_scope.get(scope_ref)).into_iter().map(|s| s.id).collect()
    }

    pub(crate) fn get(&self, id: SubscriptionId) -> Option<EventSubscription> {
        self.by_id.get(&id).and_then(|seq| self.slots.get(seq)).cloned()
    }

    pub(crate) fn find_by_scope(&self, scope_ref: &str) -> Vec<EventSubscription> {
        self.collect(self.by_scope.get(scope_ref))
    }

    pub(crate) fn find(&self, event_type: &str, kind: SubscriptionKind) -> Vec<EventSubscription> {
        self.collect(self.by_type_kind.get(&(event_type.to_string(), kind)))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Live subscriptions in insertion order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &EventSubscription> {
        self.slots.values()
    }

    fn collect(&self, seqs: Option<&BTreeSet<u64>>) -> Vec<EventSubscription> {
        seqs.map(|set| set.iter().filter_map(|seq| self.slots.get(seq).cloned()).collect())
            .unwrap_or_default()
    }
}

/// Ledger table keyed by correlation key.
#[derive(Debug, Default)]
pub(crate) struct LedgerTable {
    entries: HashMap<CorrelationKey, LedgerEntry>,
}

impl LedgerTable {
    /// Returns the new entry when the key was absent.
    pub(crate) fn reserve(&mut self, key: &CorrelationKey) -> Option<LedgerEntry> {
        if self.entries.contains_key(key) {
            return None;
        }
        let entry = LedgerEntry::reserved(key.clone());
        self.entries.insert(key.clone(), entry.clone());
        Some(entry)
    }

    pub(crate) fn check_bind(&self, key: &CorrelationKey) -> Result<(), StorageError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| StorageError::LedgerEntryNotFound(key.clone()))?;
        if let Some(existing) = &entry.instance_id {
            return Err(StorageError::LedgerEntryAlreadyBound {
                key: key.clone(),
                instance_id: existing.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn apply_bind(&mut self, key: &CorrelationKey, instance_id: &InstanceId) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.instance_id = Some(instance_id.clone());
            entry.bound_at = Some(Utc::now());
        }
    }

    /// Whether `release` would drop anything.
    pub(crate) fn is_reserved(&self, key: &CorrelationKey) -> bool {
        self.entries.get(key).is_some_and(|e| !e.is_bound())
    }

    pub(crate) fn apply_release(&mut self, key: &CorrelationKey) {
        if self.is_reserved(key) {
            self.entries.remove(key);
        }
    }

    pub(crate) fn insert_entry(&mut self, entry: LedgerEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    pub(crate) fn remove(&mut self, key: &CorrelationKey) -> Option<LedgerEntry> {
        self.entries.remove(key)
    }

    pub(crate) fn get(&self, key: &CorrelationKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Unbound entries, oldest reservation first.
    pub(crate) fn unbound(&self) -> Vec<LedgerEntry> {
        let mut out: Vec<LedgerEntry> = self.entries.values().filter(|e| !e.is_bound()).cloned().collect();
        out.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at).then_with(|| a.key.cmp(&b.key)));
        out
    }
}

/// Thread-safe in-memory subscription store.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    state: RwLock<SubscriptionArena>,
}

impl InMemorySubscriptionStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStore for InMemorySubscriptionStore {
    fn register(&self, subscription: EventSubscription) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("subscription.register"))?;
        state.insert(subscription)
    }

    fn unregister(&self, id: SubscriptionId) -> Result<EventSubscription, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("subscription.unregister"))?;
        state.remove(id)
    }

    fn unregister_scope(&self, scope_ref: &str) -> Result<Vec<EventSubscription>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("subscription.unregister_scope"))?;
        let ids = state.scope_ids(scope_ref);
        ids.into_iter().map(|id| state.remove(id)).collect()
    }

    fn get(&self, id: SubscriptionId) -> Result<Option<EventSubscription>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("subscription.get"))?;
        Ok(state.get(id))
    }

    fn find_by_scope(&self, scope_ref: &str) -> Result<Vec<EventSubscription>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("subscription.find_by_scope"))?;
        Ok(state.find_by_scope(scope_ref))
    }

    fn find_running_listeners(&self, event_type: &str) -> Result<Vec<EventSubscription>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("subscription.find_running"))?;
        Ok(state.find(event_type, SubscriptionKind::RunningInstance))
    }

    fn find_start_subscriptions(&self, event_type: &str) -> Result<Vec<EventSubscription>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("subscription.find_start"))?;
        Ok(state.find(event_type, SubscriptionKind::StartDefinition))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("subscription.count"))?;
        Ok(state.len())
    }
}

/// Thread-safe in-memory reference ledger.
///
/// A single mutex makes check-then-insert atomic across dispatch threads.
#[derive(Debug, Default)]
pub struct InMemoryReferenceLedger {
    table: Mutex<LedgerTable>,
}

impl InMemoryReferenceLedger {
    /// Create a new empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReferenceLedger for InMemoryReferenceLedger {
    fn insert_if_absent(&self, key: &CorrelationKey) -> Result<bool, StorageError> {
        let mut table = self.table.lock().map_err(|_| lock_err("ledger.insert_if_absent"))?;
        Ok(table.reserve(key).is_some())
    }

    fn bind(&self, key: &CorrelationKey, instance_id: &InstanceId) -> Result<(), StorageError> {
        let mut table = self.table.lock().map_err(|_| lock_err("ledger.bind"))?;
        table.check_bind(key)?;
        table.apply_bind(key, instance_id);
        Ok(())
    }

    fn release(&self, key: &CorrelationKey) -> Result<(), StorageError> {
        let mut table = self.table.lock().map_err(|_| lock_err("ledger.release"))?;
        table.apply_release(key);
        Ok(())
    }

    fn lookup(&self, key: &CorrelationKey) -> Result<Option<InstanceId>, StorageError> {
        let table = self.table.lock().map_err(|_| lock_err("ledger.lookup"))?;
        Ok(table.get(key).and_then(|e| e.instance_id.clone()))
    }

    fn entry(&self, key: &CorrelationKey) -> Result<Option<LedgerEntry>, StorageError> {
        let table = self.table.lock().map_err(|_| lock_err("ledger.entry"))?;
        Ok(table.get(key).cloned())
    }

    fn unbound(&self) -> Result<Vec<LedgerEntry>, StorageError> {
        let table = self.table.lock().map_err(|_| lock_err("ledger.unbound"))?;
        Ok(table.unbound())
    }

    fn remove(&self, key: &CorrelationKey) -> Result<Option<LedgerEntry>, StorageError> {
        let mut table = self.table.lock().map_err(|_| lock_err("ledger.remove"))?;
        Ok(table.remove(key))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let table = self.table.lock().map_err(|_| lock_err("ledger.count"))?;
        Ok(table.len())
    }
}

/// Convenience bundle of in-memory stores.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Subscription store.
    pub subscriptions: InMemorySubscriptionStore,
    /// Reference ledger.
    pub ledger: InMemoryReferenceLedger,
}

impl InMemoryStores {
    /// Create a new bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
