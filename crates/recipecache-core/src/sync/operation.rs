use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scheduler::TimerId;
use crate::key::Key;
use crate::models::Recipe;
use crate::store::StoreError;

/// Identifier of a pending operation, unique for the lifetime of its registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub(crate) fn new(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A write intent not yet confirmed by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Key the operation writes to
    pub key: Key,
    /// Remote key being renamed away from, for updates that change the name
    pub previous_key: Option<Key>,
    pub data: Option<Recipe>,
    /// Cached value before the write, restored on rollback
    pub original_data: Option<Recipe>,
    /// Whether the cache was mutated ahead of confirmation
    pub optimistic: bool,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<StoreError>,
    pub(crate) timer: Option<TimerId>,
    pub(crate) in_flight: bool,
}

impl PendingOperation {
    fn new(kind: OperationKind, key: Key) -> Self {
        Self {
            id: OperationId::new(String::new()),
            kind,
            key,
            previous_key: None,
            data: None,
            original_data: None,
            optimistic: false,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            timer: None,
            in_flight: false,
        }
    }

    pub fn create(key: Key, data: Recipe) -> Self {
        Self {
            data: Some(data),
            ..Self::new(OperationKind::Create, key)
        }
    }

    pub fn update(key: Key, data: Recipe, original_data: Option<Recipe>) -> Self {
        Self {
            data: Some(data),
            original_data,
            ..Self::new(OperationKind::Update, key)
        }
    }

    pub fn delete(key: Key, original_data: Option<Recipe>) -> Self {
        Self {
            original_data,
            ..Self::new(OperationKind::Delete, key)
        }
    }

    /// Mark the update as a rename away from `previous`. Ignored when the key is unchanged.
    pub fn renamed_from(mut self, previous: Key) -> Self {
        if previous != self.key {
            self.previous_key = Some(previous);
        }
        self
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    /// Key the record currently lives under on the remote store
    pub fn source_key(&self) -> &Key {
        self.previous_key.as_ref().unwrap_or(&self.key)
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.is_some()
    }
}

/// An operation abandoned after exhausting its retries or hitting a fatal error.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    /// Snapshot of the operation at the time it was abandoned
    pub operation: PendingOperation,
    pub error: StoreError,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} failed after {} attempt(s): {}",
            self.operation.kind, self.operation.key, self.operation.attempts, self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renamed_from_same_key_is_ignored() {
        let key = Key::from_name("Soup");
        let op = PendingOperation::update(key.clone(), Recipe::new("Soup"), None)
            .renamed_from(key.clone());
        assert_eq!(op.previous_key, None);
        assert_eq!(op.source_key(), &key);
    }

    #[test]
    fn test_source_key_for_rename() {
        let old = Key::from_name("Soup");
        let op = PendingOperation::update(Key::from_name("Stew"), Recipe::new("Stew"), None)
            .renamed_from(old.clone());
        assert_eq!(op.source_key(), &old);
        assert_eq!(op.key.as_str(), "stew.json");
    }
}
