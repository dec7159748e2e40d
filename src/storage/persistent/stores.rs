//! WAL-backed subscription store and reference ledger.
//!
//! Each store keeps the same in-memory index as the in-memory backend and
//! appends every mutation to a shared write-ahead log before applying it.
//! Opening a directory replays the log to rebuild both indices.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::engine::InstanceId;
use crate::error::{CorrelationError, CorrelationResult, ExecutionError};
use crate::ledger::{CorrelationKey, LedgerEntry};
use crate::storage::memory::{LedgerTable, SubscriptionArena};
use crate::storage::traits::{ReferenceLedger, StorageError, SubscriptionStore};
use crate::subscription::{EventSubscription, SubscriptionId, SubscriptionKind};

use super::file_lock::DirLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

/// File name of the log inside a store directory.
pub const WAL_FILE_NAME: &str = "corrflow.wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> CorrelationError {
    CorrelationError::Execution(ExecutionError::Storage {
        message: format!("{context}: {e}"),
    })
}

/// Log plus the directory lock, shared by both stores.
///
/// Stores may be moved out of [`PersistentStores`] into `Arc<dyn _>` handles,
/// so the lock lives as long as any of them.
#[derive(Debug)]
struct Journal {
    wal: WriteAheadLog,
    _lock: DirLock,
}

impl Journal {
    fn append(&self, kind: WalEntryKind) -> Result<(), StorageError> {
        self.wal
            .append(kind)
            .map(|_| ())
            .map_err(|e| StorageError::BackendError(format!("wal append failed: {e}")))
    }
}

/// Aggregate of the persistent stores for one directory.
#[derive(Debug)]
pub struct PersistentStores {
    /// The store directory.
    pub dir: PathBuf,
    journal: Arc<Journal>,
    config: PersistentConfig,

    pub subscriptions: PersistentSubscriptionStore,
    pub ledger: PersistentReferenceLedger,
}

impl PersistentStores {
    /// Open or create the store directory and replay its log.
    pub fn open(dir: &Path, config: PersistentConfig) -> CorrelationResult<Self> {
        fs::create_dir_all(dir).map_err(|e| storage_err("failed to create store directory", e))?;
        let lock = DirLock::acquire(dir).map_err(|e| storage_err("failed to acquire lock", e))?;

        let wal_path = dir.join(WAL_FILE_NAME);
        let wal = WriteAheadLog::open(&wal_path, config.sync_on_write)
            .map_err(|e| storage_err("failed to open WAL", e))?;
        let journal = Arc::new(Journal { wal, _lock: lock });

        let mut arena = SubscriptionArena::default();
        let mut table = LedgerTable::default();
        let replayed = replay(&journal.wal, &mut arena, &mut table)?;
        let unbound = table.unbound().len();
        tracing::info!(
            dir = %dir.display(),
            replayed,
            subscriptions = arena.len(),
            ledger_entries = table.len(),
            unbound,
            "persistent stores opened"
        );
        if unbound > 0 {
            // Kept: the instance may exist already. The coordinator settles them.
            tracing::warn!(unbound, "ledger holds reservations without a bound instance");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            subscriptions: PersistentSubscriptionStore {
                journal: Arc::clone(&journal),
                state: RwLock::new(arena),
            },
            ledger: PersistentReferenceLedger {
                journal: Arc::clone(&journal),
                table: Mutex::new(table),
            },
            journal,
            config,
        })
    }

    /// Rewrite the log as one record per live subscription and ledger entry.
    ///
    /// Blocks all writers on both stores for the duration.
    pub fn compact(&self) -> CorrelationResult<CompactionResult> {
        let wal_size_before = self.wal_size();

        let arena = self
            .subscriptions
            .state
            .write()
            .map_err(|_| CorrelationError::from(lock_err("compact.subscriptions")))?;
        let table = self
            .ledger
            .table
            .lock()
            .map_err(|_| CorrelationError::from(lock_err("compact.ledger")))?;

        let mut snapshot: Vec<WalEntryKind> = arena
            .iter()
            .cloned()
            .map(WalEntryKind::SubscriptionRegister)
            .collect();
        let mut entries: Vec<LedgerEntry> = table.entries().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot.extend(entries.into_iter().map(WalEntryKind::LedgerReserve));

        let records = snapshot.len();
        self.journal
            .wal
            .rewrite(snapshot)
            .map_err(|e| storage_err("failed to compact WAL", e))?;
        drop(table);
        drop(arena);

        let wal_size_after = self.wal_size();
        tracing::info!(records, wal_size_before, wal_size_after, "wal compacted");
        Ok(CompactionResult {
            records,
            wal_size_before,
            wal_size_after,
        })
    }

    /// Compact when the log has outgrown `max_wal_size`.
    pub fn compact_if_needed(&self) -> CorrelationResult<Option<CompactionResult>> {
        if self.wal_size() < self.config.max_wal_size {
            return Ok(None);
        }
        self.compact().map(Some)
    }

    /// Current log size in bytes.
    pub fn wal_size(&self) -> u64 {
        self.journal.wal.size_bytes().unwrap_or(0)
    }
}

/// Outcome of [`PersistentStores::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Records in the rewritten log.
    pub records: usize,
    pub wal_size_before: u64,
    pub wal_size_after: u64,
}

fn replay(
    wal: &WriteAheadLog,
    arena: &mut SubscriptionArena,
    table: &mut LedgerTable,
) -> CorrelationResult<usize> {
    let iter = wal.iter().map_err(|e| storage_err("failed to iterate WAL", e))?;

    let mut count = 0;
    for entry in iter {
        let entry = entry.map_err(|e| storage_err("corrupted WAL entry", e))?;
        match entry.kind {
            WalEntryKind::SubscriptionRegister(sub) => arena.insert(sub)?,
            WalEntryKind::SubscriptionUnregister { id } => {
                arena.remove(id)?;
            }
            WalEntryKind::LedgerReserve(ledger_entry) => table.insert_entry(ledger_entry),
            WalEntryKind::LedgerBind { key, instance_id } => table.apply_bind(&key, &instance_id),
            WalEntryKind::LedgerRelease { key } => table.apply_release(&key),
            WalEntryKind::LedgerRemove { key } => {
                table.remove(&key);
            }
        }
        count += 1;
    }
    Ok(count)
}

// --- Subscription Store ---

/// Subscription store that logs every registration change.
#[derive(Debug)]
pub struct PersistentSubscriptionStore {
    journal: Arc<Journal>,
    state: RwLock<SubscriptionArena>,
}

impl SubscriptionStore for PersistentSubscriptionStore {
    fn register(&self, subscription: EventSubscription) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("subscription.register"))?;
        if state.get(subscription.id).is_some() {
            return Err(StorageError::DuplicateKey(subscription.id.to_string()));
        }
        self.journal
            .append(WalEntryKind::SubscriptionRegister(subscription.clone()))?;
        state.insert(subscription)
    }

    fn unregister(&self, id: SubscriptionId) -> Result<EventSubscription, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("subscription.unregister"))?;
        if state.get(id).is_none() {
            return Err(StorageError::SubscriptionNotFound(id));
        }
        self.journal.append(WalEntryKind::SubscriptionUnregister { id })?;
        state.remove(id)
    }

    fn unregister_scope(&self, scope_ref: &str) -> Result<Vec<EventSubscription>, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("subscription.unregister_scope"))?;
        let ids = state.scope_ids(scope_ref);
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            self.journal.append(WalEntryKind::SubscriptionUnregister { id })?;
            removed.push(state.remove(id)?);
        }
        Ok(removed)
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

// --- Reference Ledger ---

/// Reference ledger that logs every reservation and binding.
///
/// The table mutex is held across the log append, so the order of records in
/// the log matches the order in which callers observed the outcomes.
#[derive(Debug)]
pub struct PersistentReferenceLedger {
    journal: Arc<Journal>,
    table: Mutex<LedgerTable>,
}

impl ReferenceLedger for PersistentReferenceLedger {
    fn insert_if_absent(&self, key: &CorrelationKey) -> Result<bool, StorageError> {
        let mut table = self.table.lock().map_err(|_| lock_err("ledger.insert_if_absent"))?;
        if table.get(key).is_some() {
            return Ok(false);
        }
        let entry = LedgerEntry::reserved(key.clone());
        self.journal.append(WalEntryKind::LedgerReserve(entry.clone()))?;
        table.insert_entry(entry);
        Ok(true)
    }

    fn bind(&self, key: &CorrelationKey, instance_id: &InstanceId) -> Result<(), StorageError> {
        let mut table = self.table.lock().map_err(|_| lock_err("ledger.bind"))?;
        table.check_bind(key)?;
        self.journal.append(WalEntryKind::LedgerBind {
            key: key.clone(),
            instance_id: instance_id.clone(),
        })?;
        table.apply_bind(key, instance_id);
        Ok(())
    }

    fn release(&self, key: &CorrelationKey) -> Result<(), StorageError> {
        let mut table = self.table.lock().map_err(|_| lock_err("ledger.release"))?;
        if !table.is_reserved(key) {
            return Ok(());
        }
        self.journal.append(WalEntryKind::LedgerRelease { key: key.clone() })?;
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
        if table.get(key).is_none() {
            return Ok(None);
        }
        self.journal.append(WalEntryKind::LedgerRemove { key: key.clone() })?;
        Ok(table.remove(key))
    }

    fn count(&self) -> Result<usize, StorageError> {
        let table = self.table.lock().map_err(|_| lock_err("ledger.count"))?;
        Ok(table.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> PersistentConfig {
        PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        }
    }

    fn unique_start(def: &str) -> EventSubscription {
        EventSubscription::start_definition("myEvent", def)
            .correlate("customerId", "kermit")
            .unique_instance(true)
            .build()
            .unwrap()
    }

    #[test]
    fn subscriptions_survive_reopen() {
        let dir = tempdir().unwrap();
        let kept = unique_start("def-1");
        let dropped = unique_start("def-2");
        {
            let stores = PersistentStores::open(dir.path(), config()).unwrap();
            stores.subscriptions.register(kept.clone()).unwrap();
            stores.subscriptions.register(dropped.clone()).unwrap();
            stores.subscriptions.unregister(dropped.id).unwrap();
        }

        let stores = PersistentStores::open(dir.path(), config()).unwrap();
        assert_eq!(stores.subscriptions.count().unwrap(), 1);
        assert_eq!(stores.subscriptions.get(kept.id).unwrap(), Some(kept));
        assert!(stores.subscriptions.get(dropped.id).unwrap().is_none());
    }

    #[test]
    fn bound_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let key = CorrelationKey::compute("def-1", "myEvent", &[]);
        {
            let stores = PersistentStores::open(dir.path(), config()).unwrap();
            assert!(stores.ledger.insert_if_absent(&key).unwrap());
            stores.ledger.bind(&key, &InstanceId::new("inst-1")).unwrap();
        }

        let stores = PersistentStores::open(dir.path(), config()).unwrap();
        assert_eq!(stores.ledger.lookup(&key).unwrap(), Some(InstanceId::new("inst-1")));
        assert!(!stores.ledger.insert_if_absent(&key).unwrap());
    }

    #[test]
    fn unbound_reservation_survives_reopen() {
        let dir = tempdir().unwrap();
        let key = CorrelationKey::compute("def-1", "myEvent", &[]);
        {
            let stores = PersistentStores::open(dir.path(), config()).unwrap();
            assert!(stores.ledger.insert_if_absent(&key).unwrap());
        }

        let stores = PersistentStores::open(dir.path(), config()).unwrap();
        assert_eq!(stores.ledger.count().unwrap(), 1);
        assert!(!stores.ledger.insert_if_absent(&key).unwrap());
        let unbound = stores.ledger.unbound().unwrap();
        assert_eq!(unbound.len(), 1);
        assert_eq!(unbound[0].key, key);
    }

    #[test]
    fn second_open_is_rejected_while_locked() {
        let dir = tempdir().unwrap();
        let _stores = PersistentStores::open(dir.path(), config()).unwrap();
        let err = PersistentStores::open(dir.path(), config()).unwrap_err();
        assert!(err.is_execution());
    }

    #[test]
    fn compaction_keeps_live_state() {
        let dir = tempdir().unwrap();
        let key = CorrelationKey::compute("def-1", "myEvent", &[]);
        {
            let stores = PersistentStores::open(dir.path(), config()).unwrap();
            for i in 0..20 {
                let sub = unique_start(&format!("def-{i}"));
                stores.subscriptions.register(sub.clone()).unwrap();
                if i > 0 {
                    stores.subscriptions.unregister(sub.id).unwrap();
                }
            }
            assert!(stores.ledger.insert_if_absent(&key).unwrap());
            stores.ledger.bind(&key, &InstanceId::new("inst-1")).unwrap();

            let result = stores.compact().unwrap();
            assert_eq!(result.records, 2);
            assert!(result.wal_size_after < result.wal_size_before);
        }

        let stores = PersistentStores::open(dir.path(), config()).unwrap();
        assert_eq!(stores.subscriptions.count().unwrap(), 1);
        assert_eq!(stores.subscriptions.find_by_scope("def-0").unwrap().len(), 1);
        assert_eq!(stores.ledger.lookup(&key).unwrap(), Some(InstanceId::new("inst-1")));
    }

    #[test]
    fn stores_keep_directory_locked_after_move() {
        let dir = tempdir().unwrap();
        let ledger: Arc<dyn ReferenceLedger> = {
            let stores = PersistentStores::open(dir.path(), config()).unwrap();
            Arc::new(stores.ledger)
        };

        assert!(PersistentStores::open(dir.path(), config()).is_err());
        drop(ledger);
        assert!(PersistentStores::open(dir.path(), config()).is_ok());
    }
}
