//! Persistent storage backend (feature `persistent`).
//!
//! Durable subscription store and reference ledger with:
//! - Write-ahead logging, replayed on open
//! - A directory lock so one process owns the store at a time
//! - CRC32 checksums with torn-tail truncation
//! - Compaction that rewrites the log down to live state
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    PersistentStores                      │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐ ┌───────────────────────┐  │
//! │  │ PersistentSubscription-  │ │ PersistentReference-  │  │
//! │  │ Store (RwLock<arena>)    │ │ Ledger (Mutex<table>) │  │
//! │  └────────────┬─────────────┘ └───────────┬───────────┘  │
//! │               └─────────────┬─────────────┘              │
//! │                             ↓                            │
//! │              WriteAheadLog  +  DirLock (flock)           │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod codec;
mod file_lock;
mod stores;
mod wal;

pub use file_lock::DirLock;
pub use stores::{
    CompactionResult, PersistentReferenceLedger, PersistentStores, PersistentSubscriptionStore,
    WAL_FILE_NAME,
};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::error::{CorrelationResult, ValidationError};

/// Configuration for persistent storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentConfig {
    /// Log size that makes [`PersistentStores::compact_if_needed`] compact (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every append (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    pub fn validate(self) -> CorrelationResult<Self> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(ValidationError::InvalidConfig {
                reason: format!(
                    "max_wal_size must be at least {} bytes (got {})",
                    Self::MIN_WAL_SIZE,
                    self.max_wal_size
                ),
            }
            .into());
        }
        Ok(self)
    }
}

/// Open or create persistent stores in `path`.
///
/// # Errors
/// - If the directory cannot be created or accessed
/// - If another process holds the directory lock
/// - If log replay hits a record that cannot be applied
///
/// # Example
/// ```rust,ignore
/// use corrflow::storage::persistent::open_stores;
///
/// let stores = open_stores("./correlation.db", None)?;
/// let coordinator = DispatchCoordinator::new(
///     Arc::new(stores.subscriptions),
///     Arc::new(stores.ledger),
///     engine,
/// );
/// ```
pub fn open_stores(path: impl AsRef<Path>, config: Option<PersistentConfig>) -> CorrelationResult<PersistentStores> {
    let cfg = config.unwrap_or_default().validate()?;
    PersistentStores::open(path.as_ref(), cfg)
}
