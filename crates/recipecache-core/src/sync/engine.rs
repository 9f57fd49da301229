use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use super::operation::{OperationId, OperationKind, PendingOperation, SyncFailure};
use super::registry::PendingRegistry;
use super::scheduler::Scheduler;
use crate::events::{EventBus, RepositoryEvent};
use crate::key::Key;
use crate::lock;
use crate::store::{RemoteStore, StoreError};

/// How a `run` call ended without failing.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The remote store confirmed the write; carries the resolved operation
    Synced(PendingOperation),
    /// The operation left the registry before this run tried it
    /// (coalesced, or resolved by another run)
    Superseded,
    /// The operation was dropped after at least one failed attempt, either
    /// cleared from the registry or its backoff timer cancelled. Carries the
    /// last snapshot, `last_error` included.
    Cancelled(PendingOperation),
}

impl SyncOutcome {
    pub fn attempts(&self) -> Option<u32> {
        match self {
            SyncOutcome::Synced(op) | SyncOutcome::Cancelled(op) => Some(op.attempts),
            SyncOutcome::Superseded => None,
        }
    }
}

/// Delay before retrying after failed attempt number `attempt` (1-based):
/// `retry_delay * 2^(attempt - 1)`.
pub fn backoff(retry_delay: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    retry_delay.saturating_mul(1u32 << exponent)
}

/// Executes pending operations against a [`RemoteStore`].
///
/// At most one run per key talks to the store at a time; later runs for the
/// same key wait their turn in FIFO order, backoff sleeps included.
/// Backoff waits run on the injected [`Scheduler`], so `cancel_all` stops them.
pub struct SyncEngine {
    registry: Arc<Mutex<PendingRegistry>>,
    events: EventBus<RepositoryEvent>,
    scheduler: Arc<dyn Scheduler>,
    key_locks: Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>,
    max_retries: u32,
    retry_delay: Duration,
    logging: bool,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<Mutex<PendingRegistry>>,
        events: EventBus<RepositoryEvent>,
        scheduler: Arc<dyn Scheduler>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            scheduler,
            key_locks: Mutex::new(HashMap::new()),
            max_retries,
            retry_delay,
            logging: true,
        }
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Drive one operation to resolution or abandonment.
    pub async fn run(
        &self,
        store: &dyn RemoteStore,
        id: &OperationId,
    ) -> Result<SyncOutcome, SyncFailure> {
        let key = {
            let mut registry = lock(&self.registry);
            match registry.get_mut(id) {
                Some(op) => {
                    op.in_flight = true;
                    op.key.clone()
                }
                None => return Ok(SyncOutcome::Superseded),
            }
        };

        let key_lock = self.key_lock(&key);
        let result = {
            let _guard = key_lock.lock().await;
            self.attempt_until_resolved(store, id).await
        };
        drop(key_lock);
        self.release_key_lock(&key);
        result
    }

    async fn attempt_until_resolved(
        &self,
        store: &dyn RemoteStore,
        id: &OperationId,
    ) -> Result<SyncOutcome, SyncFailure> {
        // Snapshot after the latest failed attempt of this run
        let mut failed: Option<PendingOperation> = None;
        loop {
            let op = {
                let mut registry = lock(&self.registry);
                match registry.get_mut(id) {
                    Some(op) => {
                        op.attempts += 1;
                        op.clone()
                    }
                    None => return Ok(vanished(failed)),
                }
            };

            let error = match dispatch(store, &op).await {
                Ok(()) => {
                    lock(&self.registry).remove(id);
                    diag!(self.logging, debug,
                        id = %id, kind = %op.kind, key = %op.key, attempts = op.attempts,
                        "Operation synced");
                    self.events.emit(RepositoryEvent::OperationSynced {
                        operation: op.kind,
                        key: op.key.clone(),
                    });
                    let mut resolved = op;
                    resolved.in_flight = false;
                    resolved.timer = None;
                    return Ok(SyncOutcome::Synced(resolved));
                }
                Err(error) => error,
            };

            let retry = error.is_retryable() && op.attempts < self.max_retries;
            let abandoned = {
                let mut registry = lock(&self.registry);
                if retry {
                    if let Some(pending) = registry.get_mut(id) {
                        pending.last_error = Some(error.clone());
                    }
                    None
                } else {
                    match registry.remove(id) {
                        Some(removed) => Some(removed),
                        None => return Ok(vanished(failed)),
                    }
                }
            };

            if let Some(mut operation) = abandoned {
                operation.last_error = Some(error.clone());
                operation.in_flight = false;
                operation.timer = None;
                diag!(self.logging, warn,
                    id = %id, kind = %operation.kind, key = %operation.key,
                    attempts = operation.attempts, error = %error,
                    "Operation abandoned");
                self.events.emit(RepositoryEvent::OperationFailed {
                    operation: operation.kind,
                    key: operation.key.clone(),
                    error: error.clone(),
                    attempts: operation.attempts,
                });
                return Err(SyncFailure { operation, error });
            }

            let delay = backoff(self.retry_delay, op.attempts);
            diag!(self.logging, warn,
                id = %id, key = %op.key, attempt = op.attempts,
                backoff_ms = delay.as_millis() as u64, error = %error,
                "Sync attempt failed, backing off");
            self.events.emit(RepositoryEvent::OperationRetrying {
                id: id.clone(),
                key: op.key.clone(),
                attempt: op.attempts,
                delay_ms: delay.as_millis() as u64,
                error: error.clone(),
            });

            let mut snapshot = op;
            snapshot.last_error = Some(error);
            snapshot.in_flight = false;
            snapshot.timer = None;
            failed = Some(snapshot);

            if !self.scheduler.sleep(delay).await {
                lock(&self.registry).remove(id);
                diag!(self.logging, debug, id = %id, "Backoff cancelled, dropping operation");
                return Ok(vanished(failed));
            }
        }
    }

    fn key_lock(&self, key: &Key) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.key_locks);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Forget a key's lock once no run holds or awaits it
    fn release_key_lock(&self, key: &Key) {
        let mut locks = lock(&self.key_locks);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    /// Drop all per-key locks; runs already holding one keep it until they finish
    pub fn reset(&self) {
        lock(&self.key_locks).clear();
    }
}

fn vanished(failed: Option<PendingOperation>) -> SyncOutcome {
    match failed {
        Some(op) => SyncOutcome::Cancelled(op),
        None => SyncOutcome::Superseded,
    }
}

async fn dispatch(store: &dyn RemoteStore, op: &PendingOperation) -> Result<(), StoreError> {
    match op.kind {
        OperationKind::Create => store.create_file(&op.key, payload(op)?).await,
        OperationKind::Update => {
            let data = payload(op)?;
            let Some(previous) = &op.previous_key else {
                return store.update_file(&op.key, data).await;
            };

            // Rename: write the new file, then remove the old one. Either half may
            // already be done by an earlier attempt.
            if store.check_file_exists(&op.key).await? {
                store.update_file(&op.key, data).await?;
            } else {
                store.create_file(&op.key, data).await?;
            }
            tolerate_missing(store.delete_file(previous).await)
        }
        OperationKind::Delete => tolerate_missing(store.delete_file(&op.key).await),
    }
}

fn payload(op: &PendingOperation) -> Result<&crate::models::Recipe, StoreError> {
    op.data
        .as_ref()
        .ok_or_else(|| StoreError::Invalid(format!("{} of {} has no data", op.kind, op.key)))
}

fn tolerate_missing(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "Remote file already gone");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Recipe;
    use crate::sync::TokioScheduler;
    use crate::testing::{ScriptedStore, CREATE_FILE, DELETE_FILE, UPDATE_FILE};

    const DELAY: Duration = Duration::from_millis(100);

    fn engine(max_retries: u32) -> (SyncEngine, Arc<Mutex<PendingRegistry>>) {
        engine_on(max_retries, Arc::new(TokioScheduler::new()))
    }

    fn engine_on(
        max_retries: u32,
        scheduler: Arc<dyn Scheduler>,
    ) -> (SyncEngine, Arc<Mutex<PendingRegistry>>) {
        let registry = Arc::new(Mutex::new(PendingRegistry::new()));
        let engine = SyncEngine::new(
            Arc::clone(&registry),
            EventBus::default(),
            scheduler,
            max_retries,
            DELAY,
        );
        (engine, registry)
    }

    fn register(registry: &Arc<Mutex<PendingRegistry>>, op: PendingOperation) -> OperationId {
        registry.lock().unwrap().register(op)
    }

    #[test]
    fn test_backoff_formula() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff(base, 2), Duration::from_millis(2000));
        assert_eq!(backoff(base, 3), Duration::from_millis(4000));
        assert_eq!(backoff(base, 0), Duration::from_millis(1000));
        // Saturates instead of overflowing
        assert_eq!(backoff(base, 200), base.saturating_mul(1 << 31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_removes_operation() {
        let (engine, registry) = engine(3);
        let store = ScriptedStore::new();
        let soup = Recipe::new("Soup");
        let id = register(&registry, PendingOperation::create(soup.key(), soup.clone()));

        let outcome = engine.run(&store, &id).await.unwrap();
        assert_eq!(outcome.attempts(), Some(1));
        assert!(registry.lock().unwrap().is_empty());
        assert_eq!(store.inner().snapshot().get(&soup.key()), Some(&soup));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_is_respected() {
        let (engine, registry) = engine(2);
        let store = ScriptedStore::new();
        store.fail(CREATE_FILE, StoreError::Network("connection reset".into()));
        let soup = Recipe::new("Soup");
        let id = register(&registry, PendingOperation::create(soup.key(), soup));

        let failure = engine.run(&store, &id).await.unwrap_err();
        assert_eq!(store.calls(CREATE_FILE), 2);
        assert_eq!(failure.operation.attempts, 2);
        assert_eq!(failure.error, StoreError::Network("connection reset".into()));
        assert!(registry.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_timing_between_attempts() {
        let (engine, registry) = engine(3);
        let store = ScriptedStore::new();
        store.fail(CREATE_FILE, StoreError::Timeout);
        let soup = Recipe::new("Soup");
        let id = register(&registry, PendingOperation::create(soup.key(), soup));

        let started = tokio::time::Instant::now();
        engine.run(&store, &id).await.unwrap_err();
        // 100ms after attempt 1, 200ms after attempt 2, none after the last
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(310), "elapsed {:?}", elapsed);
        assert_eq!(store.calls(CREATE_FILE), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let (engine, registry) = engine(3);
        let store = ScriptedStore::new();
        store.fail_times(CREATE_FILE, StoreError::ServerError("502".into()), 1);
        let soup = Recipe::new("Soup");
        let id = register(&registry, PendingOperation::create(soup.key(), soup));

        let outcome = engine.run(&store, &id).await.unwrap();
        assert_eq!(outcome.attempts(), Some(2));
        assert_eq!(store.calls(CREATE_FILE), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let (engine, registry) = engine(5);
        let store = ScriptedStore::new();
        store.fail(UPDATE_FILE, StoreError::Conflict("sha mismatch".into()));
        let soup = Recipe::new("Soup");
        let id = register(&registry, PendingOperation::update(soup.key(), soup, None));

        let failure = engine.run(&store, &id).await.unwrap_err();
        assert_eq!(store.calls(UPDATE_FILE), 1);
        assert!(matches!(failure.error, StoreError::Conflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_of_missing_file_succeeds() {
        let (engine, registry) = engine(3);
        let store = ScriptedStore::new();
        let id = register(&registry, PendingOperation::delete(Key::from_name("Ghost"), None));

        assert!(engine.run(&store, &id).await.is_ok());
        assert_eq!(store.calls(DELETE_FILE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_writes_new_and_deletes_old() {
        let (engine, registry) = engine(3);
        let soup = Recipe::new("Soup");
        let store = ScriptedStore::with_recipes([soup.clone()]);
        let stew = Recipe::new("Stew");
        let id = register(
            &registry,
            PendingOperation::update(stew.key(), stew.clone(), Some(soup.clone()))
                .renamed_from(soup.key()),
        );

        engine.run(&store, &id).await.unwrap();
        let files = store.inner().snapshot();
        assert_eq!(files.len(), 1);
        assert_eq!(files.get(&stew.key()), Some(&stew));
        assert_eq!(store.calls(CREATE_FILE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_operation_is_superseded() {
        let (engine, registry) = engine(3);
        let store = ScriptedStore::new();
        let id = register(&registry, PendingOperation::delete(Key::from_name("x"), None));
        registry.lock().unwrap().remove(&id);

        assert_eq!(engine.run(&store, &id).await.unwrap(), SyncOutcome::Superseded);
        assert_eq!(store.calls(DELETE_FILE), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_runs_are_serialized() {
        let (engine, registry) = engine(3);
        let store = ScriptedStore::new().with_latency(Duration::from_millis(50));
        let soup = Recipe::new("Soup");
        let create = register(&registry, PendingOperation::create(soup.key(), soup.clone()));
        let updated = soup.clone().with_servings(6);
        let update = register(&registry, PendingOperation::update(soup.key(), updated.clone(), None));

        let (first, second) = tokio::join!(engine.run(&store, &create), engine.run(&store, &update));
        assert!(first.is_ok());
        assert!(second.is_ok());
        // The update only ran after the create finished, so it found the file
        assert_eq!(store.inner().snapshot().get(&soup.key()), Some(&updated));
        assert!(lock(&engine.key_locks).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_backoff_reports_cancelled() {
        let scheduler = Arc::new(TokioScheduler::new());
        let (engine, registry) = engine_on(3, scheduler.clone());
        let store = ScriptedStore::new();
        store.fail(CREATE_FILE, StoreError::Network("offline".into()));
        let soup = Recipe::new("Soup");
        let id = register(&registry, PendingOperation::create(soup.key(), soup));

        let run = engine.run(&store, &id);
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scheduler.cancel_all();
        };
        let (outcome, _) = tokio::join!(run, cancel);

        match outcome.unwrap() {
            SyncOutcome::Cancelled(op) => {
                assert_eq!(op.attempts, 1);
                assert_eq!(op.last_error, Some(StoreError::Network("offline".into())));
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(store.calls(CREATE_FILE), 1);
        assert!(registry.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_during_backoff_reports_cancelled() {
        let (engine, registry) = engine(3);
        let store = ScriptedStore::new();
        store.fail(CREATE_FILE, StoreError::Timeout);
        let soup = Recipe::new("Soup");
        let id = register(&registry, PendingOperation::create(soup.key(), soup));

        let run = engine.run(&store, &id);
        let clear = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.lock().unwrap().clear();
        };
        let (outcome, _) = tokio::join!(run, clear);

        assert!(matches!(outcome, Ok(SyncOutcome::Cancelled(_))));
        assert_eq!(store.calls(CREATE_FILE), 1);
    }
}
