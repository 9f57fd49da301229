//! Remote store adapter boundary.
//!
//! The repository never talks to the network itself. It is handed an
//! implementation of [`RemoteStore`] that persists one file per recipe,
//! addressed by [`Key`]. Encoding, authentication and transport belong to
//! the adapter.

pub mod error;
pub mod memory;

use async_trait::async_trait;

use crate::key::Key;
use crate::models::Recipe;

pub use error::StoreError;
pub use memory::MemoryStore;

/// File-based remote store holding one record per key.
///
/// Every method may fail; the repository treats failures according to
/// [`StoreError::is_retryable`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the keys of every stored record
    async fn get_file_list(&self) -> Result<Vec<Key>, StoreError>;

    /// Load one record, `None` when the file does not exist
    async fn get_file(&self, key: &Key) -> Result<Option<Recipe>, StoreError>;

    async fn create_file(&self, key: &Key, recipe: &Recipe) -> Result<(), StoreError>;

    async fn update_file(&self, key: &Key, recipe: &Recipe) -> Result<(), StoreError>;

    async fn delete_file(&self, key: &Key) -> Result<(), StoreError>;

    async fn check_file_exists(&self, key: &Key) -> Result<bool, StoreError>;
}
