use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{RemoteStore, StoreError};
use crate::key::Key;
use crate::lock;
use crate::models::Recipe;

/// In-process [`RemoteStore`], for running fully offline and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<Key, Recipe>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, keying each recipe by its name
    pub fn with_recipes(recipes: impl IntoIterator<Item = Recipe>) -> Self {
        let files = recipes.into_iter().map(|r| (r.key(), r)).collect();
        Self {
            files: Mutex::new(files),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.files).is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<Key, Recipe> {
        lock(&self.files).clone()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get_file_list(&self) -> Result<Vec<Key>, StoreError> {
        Ok(lock(&self.files).keys().cloned().collect())
    }

    async fn get_file(&self, key: &Key) -> Result<Option<Recipe>, StoreError> {
        Ok(lock(&self.files).get(key).cloned())
    }

    async fn create_file(&self, key: &Key, recipe: &Recipe) -> Result<(), StoreError> {
        let mut files = lock(&self.files);
        if files.contains_key(key) {
            return Err(StoreError::Conflict(format!("{} already exists", key)));
        }
        files.insert(key.clone(), recipe.clone());
        Ok(())
    }

    async fn update_file(&self, key: &Key, recipe: &Recipe) -> Result<(), StoreError> {
        let mut files = lock(&self.files);
        match files.get_mut(key) {
            Some(existing) => {
                *existing = recipe.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn delete_file(&self, key: &Key) -> Result<(), StoreError> {
        match lock(&self.files).remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn check_file_exists(&self, key: &Key) -> Result<bool, StoreError> {
        Ok(lock(&self.files).contains_key(key))
    }
}
