//! Scripted remote store for tests: counts calls per method and injects failures.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::key::Key;
use crate::lock;
use crate::models::Recipe;
use crate::store::{MemoryStore, RemoteStore, StoreError};

pub const GET_FILE_LIST: &str = "get_file_list";
pub const GET_FILE: &str = "get_file";
pub const CREATE_FILE: &str = "create_file";
pub const UPDATE_FILE: &str = "update_file";
pub const DELETE_FILE: &str = "delete_file";
pub const CHECK_FILE_EXISTS: &str = "check_file_exists";

struct Failure {
    error: StoreError,
    /// Remaining failures, `None` for always
    remaining: Option<usize>,
}

pub struct ScriptedStore {
    inner: MemoryStore,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, Failure>>,
    broken_files: Mutex<HashSet<Key>>,
    rejected_keys: Mutex<HashMap<Key, StoreError>>,
    latency: Duration,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::from_memory(MemoryStore::new())
    }

    pub fn with_recipes(recipes: impl IntoIterator<Item = Recipe>) -> Self {
        Self::from_memory(MemoryStore::with_recipes(recipes))
    }

    fn from_memory(inner: MemoryStore) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            broken_files: Mutex::new(HashSet::new()),
            rejected_keys: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
        }
    }

    /// Delay every call, so tests can observe state while a write is in flight
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make `method` fail on every call
    pub fn fail(&self, method: &'static str, error: StoreError) {
        lock(&self.failures).insert(method, Failure { error, remaining: None });
    }

    /// Make `method` fail on its next `times` calls
    pub fn fail_times(&self, method: &'static str, error: StoreError, times: usize) {
        lock(&self.failures).insert(method, Failure { error, remaining: Some(times) });
    }

    pub fn heal(&self, method: &'static str) {
        lock(&self.failures).remove(method);
    }

    /// Make `get_file` fail for one key only
    pub fn break_file(&self, key: Key) {
        lock(&self.broken_files).insert(key);
    }

    /// Make every write (create, update, delete) to one key fail
    pub fn reject_writes(&self, key: Key, error: StoreError) {
        lock(&self.rejected_keys).insert(key, error);
    }

    fn check_key(&self, key: &Key) -> Result<(), StoreError> {
        match lock(&self.rejected_keys).get(key) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    pub fn calls(&self, method: &'static str) -> usize {
        lock(&self.calls).get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    async fn enter(&self, method: &'static str) -> Result<(), StoreError> {
        *lock(&self.calls).entry(method).or_insert(0) += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut failures = lock(&self.failures);
        let Some(failure) = failures.get_mut(method) else {
            return Ok(());
        };
        let error = failure.error.clone();
        match failure.remaining.as_mut() {
            None => Err(error),
            Some(0) => Ok(()),
            Some(n) => {
                *n -= 1;
                Err(error)
            }
        }
    }
}

#[async_trait]
impl RemoteStore for ScriptedStore {
    async fn get_file_list(&self) -> Result<Vec<Key>, StoreError> {
        self.enter(GET_FILE_LIST).await?;
        self.inner.get_file_list().await
    }

    async fn get_file(&self, key: &Key) -> Result<Option<Recipe>, StoreError> {
        self.enter(GET_FILE).await?;
        if lock(&self.broken_files).contains(key) {
            return Err(StoreError::Invalid(format!("{} is corrupt", key)));
        }
        self.inner.get_file(key).await
    }

    async fn create_file(&self, key: &Key, recipe: &Recipe) -> Result<(), StoreError> {
        self.enter(CREATE_FILE).await?;
        self.check_key(key)?;
        self.inner.create_file(key, recipe).await
    }

    async fn update_file(&self, key: &Key, recipe: &Recipe) -> Result<(), StoreError> {
        self.enter(UPDATE_FILE).await?;
        self.check_key(key)?;
        self.inner.update_file(key, recipe).await
    }

    async fn delete_file(&self, key: &Key) -> Result<(), StoreError> {
        self.enter(DELETE_FILE).await?;
        self.check_key(key)?;
        self.inner.delete_file(key).await
    }

    async fn check_file_exists(&self, key: &Key) -> Result<bool, StoreError> {
        self.enter(CHECK_FILE_EXISTS).await?;
        self.inner.check_file_exists(key).await
    }
}
