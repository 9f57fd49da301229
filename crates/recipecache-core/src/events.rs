//! Typed publish/subscribe for repository state transitions.
//!
//! Observers call [`EventBus::subscribe`] and receive every event published
//! afterwards. Publishing never blocks; a subscriber that falls more than
//! the bus capacity behind sees `RecvError::Lagged` and skips ahead.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::key::Key;
use crate::models::Recipe;
use crate::store::StoreError;
use crate::sync::{OperationId, OperationKind, SyncFailure};

/// Events buffered per subscriber before it starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Broadcast channel carrying one closed event type.
#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber, returning how many received it
    pub fn emit(&self, event: E) -> usize {
        // No subscribers is not an error for a passive bus
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryState {
    #[default]
    Idle,
    Loading,
    Syncing,
    Error,
}

impl fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryState::Idle => write!(f, "idle"),
            RepositoryState::Loading => write!(f, "loading"),
            RepositoryState::Syncing => write!(f, "syncing"),
            RepositoryState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheChange {
    Added(Key),
    Removed(Key),
    Cleared,
}

#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    StateChanged {
        previous: RepositoryState,
        current: RepositoryState,
    },
    /// Full list of valid cached recipes after a change
    RecipesUpdated(Vec<Recipe>),
    RecipeCreated(Recipe),
    RecipeUpdated(Recipe),
    RecipeDeleted {
        key: Key,
        data: Option<Recipe>,
    },
    SyncStarted {
        operation_count: usize,
    },
    SyncCompleted {
        operation_count: usize,
    },
    SyncFailed {
        failures: Vec<SyncFailure>,
    },
    CacheUpdated(CacheChange),
    OperationSynced {
        operation: OperationKind,
        key: Key,
    },
    OperationRetrying {
        id: OperationId,
        key: Key,
        attempt: u32,
        delay_ms: u64,
        error: StoreError,
    },
    OperationFailed {
        operation: OperationKind,
        key: Key,
        error: StoreError,
        attempts: u32,
    },
    /// An optimistic cache change was reverted after its write failed
    RolledBack {
        operation: OperationKind,
        key: Key,
    },
    Error {
        operation: &'static str,
        error: String,
        context: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl RepositoryEvent {
    pub fn error(operation: &'static str, error: impl fmt::Display, context: Option<String>) -> Self {
        RepositoryEvent::Error {
            operation,
            error: error.to_string(),
            context,
            timestamp: Utc::now(),
        }
    }
}
