use indexmap::IndexMap;
use tracing::debug;

use super::operation::{OperationId, OperationKind, PendingOperation};
use super::scheduler::TimerId;
use crate::key::Key;
use crate::models::Recipe;

/// Outcome of registering a write with [`PendingRegistry::coalesce`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// No mergeable operation existed; the write got its own id
    New(OperationId),
    /// The write was folded into an existing, not-yet-started operation
    Merged {
        id: OperationId,
        cancelled_timer: Option<TimerId>,
    },
    /// The write cancelled out an existing operation (create then delete)
    Cancelled {
        id: OperationId,
        cancelled_timer: Option<TimerId>,
    },
}

impl Registration {
    /// Operation that now carries the write, if any
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            Registration::New(id) | Registration::Merged { id, .. } => Some(id),
            Registration::Cancelled { .. } => None,
        }
    }

    /// Timer detached from a superseded operation, to be cancelled by the caller
    pub fn cancelled_timer(&self) -> Option<TimerId> {
        match self {
            Registration::New(_) => None,
            Registration::Merged { cancelled_timer, .. }
            | Registration::Cancelled { cancelled_timer, .. } => *cancelled_timer,
        }
    }
}

/// In-flight and queued write intents, in registration order.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    operations: IndexMap<OperationId, PendingOperation>,
    next_seq: u64,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> OperationId {
        self.next_seq += 1;
        let salt: u32 = rand::random();
        OperationId::new(format!("op-{}-{:08x}", self.next_seq, salt))
    }

    /// Track a new operation under a fresh id
    pub fn register(&mut self, mut op: PendingOperation) -> OperationId {
        let id = self.next_id();
        op.id = id.clone();
        op.attempts = 0;
        op.timer = None;
        op.in_flight = false;
        debug!(id = %id, kind = %op.kind, key = %op.key, "Registered pending operation");
        self.operations.insert(id.clone(), op);
        id
    }

    /// Register `incoming`, merging it into a queued operation on the same
    /// remote key when one exists and has not started syncing.
    pub fn coalesce(&mut self, incoming: PendingOperation) -> Registration {
        let source = incoming.source_key().clone();
        let existing_id = self
            .operations
            .values()
            .rev()
            .find(|op| !op.in_flight && op.attempts == 0 && op.key == source)
            .map(|op| op.id.clone());

        let Some(existing_id) = existing_id else {
            return Registration::New(self.register(incoming));
        };
        let Some(existing) = self.operations.get(&existing_id) else {
            return Registration::New(self.register(incoming));
        };

        match merge(existing, &incoming) {
            Merge::Replace(mut merged) => {
                let cancelled_timer = existing.timer;
                merged.timer = None;
                debug!(
                    id = %existing_id,
                    from = %existing.kind,
                    with = %incoming.kind,
                    into = %merged.kind,
                    "Coalesced pending operation"
                );
                self.operations.insert(existing_id.clone(), merged);
                Registration::Merged {
                    id: existing_id,
                    cancelled_timer,
                }
            }
            Merge::Drop => {
                let cancelled_timer = existing.timer;
                debug!(id = %existing_id, key = %source, "Create and delete cancelled out");
                self.operations.shift_remove(&existing_id);
                Registration::Cancelled {
                    id: existing_id,
                    cancelled_timer,
                }
            }
            Merge::Keep => Registration::New(self.register(incoming)),
        }
    }

    pub fn get(&self, id: &OperationId) -> Option<&PendingOperation> {
        self.operations.get(id)
    }

    pub fn get_mut(&mut self, id: &OperationId) -> Option<&mut PendingOperation> {
        self.operations.get_mut(id)
    }

    pub fn remove(&mut self, id: &OperationId) -> Option<PendingOperation> {
        self.operations.shift_remove(id)
    }

    /// Every operation writing to or renaming away from `key`
    pub fn list_by_key(&self, key: &Key) -> Vec<&PendingOperation> {
        self.operations
            .values()
            .filter(|op| &op.key == key || op.previous_key.as_ref() == Some(key))
            .collect()
    }

    /// Give the oldest optimistic operation on `key` a new `original_data`.
    /// Used when an earlier write to the key is abandoned while this one is
    /// still queued. Returns the id of the operation that took it.
    pub fn hand_down_original(
        &mut self,
        key: &Key,
        original: Option<Recipe>,
    ) -> Option<OperationId> {
        let next = self
            .operations
            .values_mut()
            .find(|op| op.optimistic && (&op.key == key || op.previous_key.as_ref() == Some(key)))?;
        next.original_data = original;
        Some(next.id.clone())
    }

    pub fn all(&self) -> Vec<&PendingOperation> {
        self.operations.values().collect()
    }

    pub fn ids(&self) -> Vec<OperationId> {
        self.operations.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Attach a timer, returning the one it replaces so the caller can cancel it
    pub fn set_timer(&mut self, id: &OperationId, timer: TimerId) -> Option<TimerId> {
        self.operations
            .get_mut(id)
            .and_then(|op| op.timer.replace(timer))
    }

    pub fn take_timer(&mut self, id: &OperationId) -> Option<TimerId> {
        self.operations.get_mut(id).and_then(|op| op.timer.take())
    }

    /// Drop everything, returning the timers that were still attached.
    /// Ids keep increasing afterwards.
    pub fn clear(&mut self) -> Vec<TimerId> {
        let timers = self.operations.values().filter_map(|op| op.timer).collect();
        self.operations.clear();
        timers
    }
}

enum Merge {
    Replace(PendingOperation),
    Drop,
    Keep,
}

fn merge(existing: &PendingOperation, incoming: &PendingOperation) -> Merge {
    use OperationKind::*;

    let optimistic = existing.optimistic || incoming.optimistic;
    match (existing.kind, incoming.kind) {
        // Never reached the remote store: still a create, under the newest name
        (Create, Create) | (Create, Update) => Merge::Replace(PendingOperation {
            kind: Create,
            key: incoming.key.clone(),
            previous_key: None,
            data: incoming.data.clone(),
            original_data: existing.original_data.clone(),
            optimistic,
            ..existing.clone()
        }),
        (Create, Delete) => Merge::Drop,
        (Update, Update) => {
            let source = existing.source_key().clone();
            Merge::Replace(
                PendingOperation {
                    kind: Update,
                    key: incoming.key.clone(),
                    previous_key: None,
                    data: incoming.data.clone(),
                    original_data: existing.original_data.clone(),
                    optimistic,
                    ..existing.clone()
                }
                .renamed_from(source),
            )
        }
        (Update, Delete) => Merge::Replace(PendingOperation {
            kind: Delete,
            key: existing.source_key().clone(),
            previous_key: None,
            data: None,
            original_data: existing.original_data.clone(),
            optimistic,
            ..existing.clone()
        }),
        // The file still exists remotely, so recreating it is an update
        (Delete, Create) => Merge::Replace(PendingOperation {
            kind: Update,
            key: incoming.key.clone(),
            previous_key: None,
            data: incoming.data.clone(),
            original_data: existing.original_data.clone(),
            optimistic,
            ..existing.clone()
        }),
        (Delete, Update) | (Delete, Delete) | (Update, Create) => Merge::Keep,
    }
}
