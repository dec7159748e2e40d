//! Storage for subscriptions and the reference ledger.
//!
//! [`traits`] defines the backend contract; [`memory`] is the in-process
//! backend and `persistent` (feature `persistent`) the WAL-backed one.

pub mod memory;
pub mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{InMemoryReferenceLedger, InMemoryStores, InMemorySubscriptionStore};
pub use traits::{ReferenceLedger, StorageError, SubscriptionStore};
