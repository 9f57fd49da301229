//! Offline-first recipe cache with optimistic synchronization.
//!
//! A [`Repository`] serves recipes from an in-memory TTL cache and writes
//! through to a slow, eventually-consistent [`RemoteStore`] (one file per
//! recipe). Writes can be applied to the cache before the store confirms
//! them; failed writes are retried with exponential backoff and rolled back
//! once the retry budget is spent. Observers follow along through
//! [`RepositoryEvent`]s.
//!
//! ```no_run
//! use std::sync::Arc;
//! use recipecache_core::{MemoryStore, Recipe, Repository, RepositoryConfig, WriteOptions};
//!
//! # async fn demo() -> recipecache_core::Result<()> {
//! let repo = Repository::with_store(RepositoryConfig::default(), Arc::new(MemoryStore::new()));
//! repo.create(Recipe::new("Pancakes"), WriteOptions::default()).await?;
//! let pancakes = repo.get_by_name("Pancakes", false).await?;
//! assert!(pancakes.is_some());
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard};

/// Repository diagnostics, gated on `RepositoryConfig::enable_logging`.
macro_rules! diag {
    ($enabled:expr, $level:ident, $($arg:tt)+) => {
        if $enabled {
            tracing::$level!($($arg)+);
        }
    };
}

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod key;
pub mod models;
pub mod repository;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cache::{CacheMetadata, CacheStore};
pub use config::{RepositoryConfig, SyncStrategy};
pub use error::{RepositoryError, Result};
pub use events::{CacheChange, EventBus, RepositoryEvent, RepositoryState};
pub use key::{derive_key, Key};
pub use models::Recipe;
pub use repository::{
    GetAllOptions, RecipeListing, Repository, RepositoryStatus, SyncReport, WriteOptions,
};
pub use store::{MemoryStore, RemoteStore, StoreError};
pub use sync::{
    OperationId, OperationKind, PendingOperation, Scheduler, SyncFailure, SyncOutcome,
    TokioScheduler,
};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
/// Every critical section here leaves its data consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
