//! Repository facade: cache-first reads and optimistic writes.
//!
//! Reads are served from the [`CacheStore`] while entries are fresh and fall
//! back to the [`RemoteStore`]. Writes update the cache first (unless
//! optimistic updates are off), register a [`PendingOperation`] and hand it to
//! the [`SyncEngine`] according to the effective [`SyncStrategy`]. A write
//! that exhausts its retries is rolled back out of the cache.

use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::join_all;
use tokio::sync::broadcast;

use crate::cache::{CacheMetadata, CacheStore};
use crate::config::{RepositoryConfig, SyncStrategy};
use crate::error::{RepositoryError, Result};
use crate::events::{CacheChange, EventBus, RepositoryEvent, RepositoryState};
use crate::key::{derive_key, Key};
use crate::lock;
use crate::models::Recipe;
use crate::store::{RemoteStore, StoreError};
use crate::sync::{
    OperationId, OperationKind, PendingOperation, PendingRegistry, Scheduler, SyncEngine,
    SyncFailure, SyncOutcome, TokioScheduler,
};


/// Per-call overrides for a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Overrides `RepositoryConfig::sync_strategy`
    pub sync_strategy: Option<SyncStrategy>,
    /// Overrides `RepositoryConfig::optimistic_updates`
    pub optimistic: Option<bool>,
}

impl WriteOptions {
    pub fn immediate() -> Self {
        Self::strategy(SyncStrategy::Immediate)
    }

    pub fn strategy(strategy: SyncStrategy) -> Self {
        Self {
            sync_strategy: Some(strategy),
            optimistic: None,
        }
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = Some(optimistic);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetAllOptions {
    /// Skip the cache and reload everything from the remote store
    pub force_refresh: bool,
    pub include_metadata: bool,
}

impl GetAllOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
            include_metadata: false,
        }
    }

    pub fn with_metadata(mut self) -> Self {
        self.include_metadata = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecipeListing {
    pub recipes: Vec<Recipe>,
    pub metadata: Option<CacheMetadata>,
}

/// Result of a successful [`Repository::sync_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub operation_count: usize,
    pub synced: usize,
    /// Operations that were coalesced away or resolved by another run meanwhile
    pub superseded: usize,
}

/// Point-in-time summary for status bars and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryStatus {
    pub state: RepositoryState,
    /// Valid (non-expired) cache entries
    pub cached: usize,
    pub pending: usize,
    pub scheduled_timers: usize,
    pub store_configured: bool,
}

/// Offline-first recipe repository. Clones share the same cache and queue.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<Inner>,
}

struct Inner {
    config: RepositoryConfig,
    store: RwLock<Option<Arc<dyn RemoteStore>>>,
    cache: Mutex<CacheStore>,
    registry: Arc<Mutex<PendingRegistry>>,
    engine: SyncEngine,
    scheduler: Arc<dyn Scheduler>,
    events: EventBus<RepositoryEvent>,
    state: Mutex<RepositoryState>,
}

impl Repository {
    /// Create a repository with no remote store yet. Writes queue up; reads
    /// and syncs fail with [`RepositoryError::NotConfigured`] until
    /// [`Repository::set_store`] is called.
    pub fn new(config: RepositoryConfig) -> Self {
        Self::with_scheduler(config, None, Arc::new(TokioScheduler::new()))
    }

    pub fn with_store(config: RepositoryConfig, store: Arc<dyn RemoteStore>) -> Self {
        Self::with_scheduler(config, Some(store), Arc::new(TokioScheduler::new()))
    }

    pub fn with_scheduler(
        config: RepositoryConfig,
        store: Option<Arc<dyn RemoteStore>>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let registry = Arc::new(Mutex::new(PendingRegistry::new()));
        let events = EventBus::default();
        let engine = SyncEngine::new(
            Arc::clone(&registry),
            events.clone(),
            Arc::clone(&scheduler),
            config.max_retries,
            config.retry_delay(),
        )
        .with_logging(config.enable_logging);

        diag!(
            config.enable_logging,
            info,
            strategy = %config.sync_strategy,
            max_retries = config.max_retries,
            optimistic = config.optimistic_updates,
            "Repository initialized"
        );

        Self {
            inner: Arc::new(Inner {
                cache: Mutex::new(CacheStore::new(config.cache_timeout())),
                store: RwLock::new(store),
                registry,
                engine,
                scheduler,
                events,
                state: Mutex::new(RepositoryState::Idle),
                config,
            }),
        }
    }

    /// Attach or replace the remote store.
    pub fn set_store(&self, store: Arc<dyn RemoteStore>) {
        let mut slot = self
            .inner
            .store
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(store);
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> RepositoryState {
        *lock(&self.inner.state)
    }

    pub fn cache_metadata(&self) -> CacheMetadata {
        lock(&self.inner.cache).metadata()
    }

    /// Snapshot of queued operations in registration order
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        lock(&self.inner.registry).all().into_iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    pub fn status(&self) -> RepositoryStatus {
        RepositoryStatus {
            state: self.state(),
            cached: lock(&self.inner.cache).valid_count(),
            pending: self.pending_count(),
            scheduled_timers: self.inner.scheduler.pending(),
            store_configured: self.store().is_ok(),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// List every recipe, from cache when it holds fresh entries.
    pub async fn get_all(&self, options: GetAllOptions) -> Result<RecipeListing> {
        if !options.force_refresh {
            let mut cache = lock(&self.inner.cache);
            let recipes = cache.all();
            if !recipes.is_empty() {
                let metadata = options.include_metadata.then(|| cache.metadata());
                drop(cache);
                diag!(self.logging(), debug, count = recipes.len(), "Serving recipes from cache");
                return Ok(RecipeListing { recipes, metadata });
            }
        }

        let store = self.store()?;
        self.set_state(RepositoryState::Loading);

        let loaded = match self.load_all(store.as_ref()).await {
            Ok(loaded) => loaded,
            Err(e) => {
                diag!(self.logging(), warn, error = %e, "Failed to load recipes");
                self.set_state(RepositoryState::Error);
                self.emit(RepositoryEvent::error("getAll", &e, None));
                return Err(RepositoryError::Load(e));
            }
        };

        lock(&self.inner.cache).replace_all(loaded);
        self.reapply_pending();
        self.set_state(RepositoryState::Idle);
        self.emit(RepositoryEvent::CacheUpdated(CacheChange::Cleared));

        let (recipes, metadata) = {
            let mut cache = lock(&self.inner.cache);
            let recipes = cache.all();
            (recipes, options.include_metadata.then(|| cache.metadata()))
        };
        self.emit(RepositoryEvent::RecipesUpdated(recipes.clone()));
        Ok(RecipeListing { recipes, metadata })
    }

    /// Look up one recipe by name (or key). `None` if the store has no such file.
    pub async fn get_by_name(&self, name: &str, force_refresh: bool) -> Result<Option<Recipe>> {
        let key = derive_key(name);
        if !force_refresh {
            if let Some(recipe) = lock(&self.inner.cache).get(&key) {
                return Ok(Some(recipe));
            }
        }

        let store = self.store()?;
        match store.get_file(&key).await {
            Ok(Some(recipe)) => {
                self.cache_set(key, recipe.clone());
                Ok(Some(recipe))
            }
            Ok(None) => {
                self.cache_remove(&key);
                Ok(None)
            }
            Err(e) => {
                diag!(self.logging(), warn, key = %key, error = %e, "Failed to load recipe");
                self.emit(RepositoryEvent::error("getByName", &e, Some(key.to_string())));
                Err(RepositoryError::Load(e))
            }
        }
    }

    /// Fetch the file list, then every file concurrently. Files that fail
    /// to load are skipped so one bad record does not hide the rest.
    async fn load_all(&self, store: &dyn RemoteStore) -> Result<Vec<(Key, Recipe)>, StoreError> {
        let keys = store.get_file_list().await?;
        let results = join_all(keys.iter().map(|key| store.get_file(key))).await;

        let mut loaded = Vec::with_capacity(keys.len());
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(Some(recipe)) => {
                    let derived = recipe.key();
                    if &derived != key {
                        diag!(
                            self.logging(),
                            debug,
                            file = %key,
                            key = %derived,
                            "File name does not match recipe name, caching under derived key"
                        );
                    }
                    loaded.push((derived, recipe));
                }
                Ok(None) => {
                    diag!(self.logging(), debug, key = %key, "Listed file vanished before load");
                }
                Err(e) => {
                    diag!(self.logging(), warn, key = %key, error = %e, "Skipping unreadable recipe");
                }
            }
        }
        Ok(loaded)
    }

    /// After a reload, put still-pending optimistic writes back on top of the
    /// remote snapshot so the caller keeps seeing their own edits.
    fn reapply_pending(&self) {
        let pending: Vec<PendingOperation> = lock(&self.inner.registry)
            .all()
            .into_iter()
            .filter(|op| op.optimistic)
            .cloned()
            .collect();

        let mut cache = lock(&self.inner.cache);
        for op in pending {
            match op.kind {
                OperationKind::Create | OperationKind::Update => {
                    if let Some(previous) = &op.previous_key {
                        cache.remove(previous);
                    }
                    if let Some(data) = op.data {
                        cache.set(op.key, data);
                    }
                }
                OperationKind::Delete => {
                    cache.remove(&op.key);
                }
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create a recipe. Returns the recipe as written to the cache.
    pub async fn create(&self, recipe: Recipe, options: WriteOptions) -> Result<Recipe> {
        let (strategy, optimistic) = self.resolve(options)?;
        let key = recipe.key();

        if optimistic {
            self.cache_set(key.clone(), recipe.clone());
            self.emit(RepositoryEvent::RecipeCreated(recipe.clone()));
            self.emit_recipes_updated();
        }

        let op = PendingOperation::create(key, recipe.clone()).optimistic(optimistic);
        self.submit(op, strategy).await?;
        Ok(recipe)
    }

    /// Replace the recipe stored under `name`. If `recipe.name` derives a
    /// different key the remote file is renamed.
    pub async fn update(&self, name: &str, recipe: Recipe, options: WriteOptions) -> Result<Recipe> {
        let (strategy, optimistic) = self.resolve(options)?;
        let old_key = derive_key(name);
        let new_key = recipe.key();
        let original = lock(&self.inner.cache).get(&old_key);

        if optimistic {
            if old_key != new_key {
                self.cache_remove(&old_key);
            }
            self.cache_set(new_key.clone(), recipe.clone());
            self.emit(RepositoryEvent::RecipeUpdated(recipe.clone()));
            self.emit_recipes_updated();
        }

        let op = PendingOperation::update(new_key, recipe.clone(), original)
            .renamed_from(old_key)
            .optimistic(optimistic);
        self.submit(op, strategy).await?;
        Ok(recipe)
    }

    pub async fn delete(&self, name: &str, options: WriteOptions) -> Result<bool> {
        let (strategy, optimistic) = self.resolve(options)?;
        let key = derive_key(name);
        let original = lock(&self.inner.cache).get(&key);

        if optimistic {
            self.cache_remove(&key);
            self.emit(RepositoryEvent::RecipeDeleted {
                key: key.clone(),
                data: original.clone(),
            });
            self.emit_recipes_updated();
        }

        let op = PendingOperation::delete(key, original).optimistic(optimistic);
        self.submit(op, strategy).await?;
        Ok(true)
    }

    /// Effective strategy and optimism for a write. Immediate writes need a
    /// store up front; the others can queue offline.
    fn resolve(&self, options: WriteOptions) -> Result<(SyncStrategy, bool)> {
        let strategy = options.sync_strategy.unwrap_or(self.inner.config.sync_strategy);
        let optimistic = options
            .optimistic
            .unwrap_or(self.inner.config.optimistic_updates);
        if strategy == SyncStrategy::Immediate {
            self.store()?;
        }
        Ok((strategy, optimistic))
    }

    async fn submit(&self, op: PendingOperation, strategy: SyncStrategy) -> Result<()> {
        let (kind, key) = (op.kind, op.key.clone());
        let registration = lock(&self.inner.registry).coalesce(op);
        if let Some(timer) = registration.cancelled_timer() {
            self.inner.scheduler.cancel(timer);
        }

        let Some(id) = registration.operation_id().cloned() else {
            diag!(self.logging(), debug, key = %key, operation = %kind, "Write cancelled out a pending operation");
            return Ok(());
        };

        match strategy {
            SyncStrategy::Immediate => self.sync_now(&id).await,
            SyncStrategy::Delayed => {
                self.schedule_sync(&id);
                Ok(())
            }
            SyncStrategy::Batch | SyncStrategy::Manual => {
                diag!(self.logging(), debug, key = %key, operation = %kind, "Queued until sync_all");
                Ok(())
            }
        }
    }

    async fn sync_now(&self, id: &OperationId) -> Result<()> {
        let store = self.store()?;
        let timer = lock(&self.inner.registry).take_timer(id);
        if let Some(timer) = timer {
            self.inner.scheduler.cancel(timer);
        }

        match self.inner.engine.run(store.as_ref(), id).await {
            Ok(SyncOutcome::Cancelled(op)) => {
                diag!(self.logging(), warn, key = %op.key, attempts = op.attempts, "Write cancelled while retrying");
                self.emit(RepositoryEvent::error(
                    "sync",
                    "cancelled while retrying",
                    Some(op.key.to_string()),
                ));
                Err(RepositoryError::cancelled(&op))
            }
            Ok(outcome) => {
                self.confirm(&outcome);
                Ok(())
            }
            Err(failure) => {
                self.rollback(&failure.operation);
                self.emit(RepositoryEvent::error(
                    "sync",
                    &failure.error,
                    Some(failure.operation.key.to_string()),
                ));
                Err(failure.into())
            }
        }
    }

    /// Run `id` after the retry delay, replacing any timer it already had.
    fn schedule_sync(&self, id: &OperationId) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task_id = id.clone();
        let delay = self.inner.config.retry_delay();

        let timer = self.inner.scheduler.schedule(
            delay,
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    Repository { inner }.run_background(task_id).await;
                }
            }),
        );

        let replaced = lock(&self.inner.registry).set_timer(id, timer);
        if let Some(replaced) = replaced {
            self.inner.scheduler.cancel(replaced);
        }
    }

    async fn run_background(&self, id: OperationId) {
        // The timer that woke us is done; nothing should cancel it by id now
        lock(&self.inner.registry).take_timer(&id);

        let store = match self.store() {
            Ok(store) => store,
            Err(_) => {
                diag!(self.logging(), warn, id = %id, "No remote store, operation stays pending");
                return;
            }
        };

        match self.inner.engine.run(store.as_ref(), &id).await {
            Ok(SyncOutcome::Cancelled(op)) => {
                diag!(self.logging(), debug, key = %op.key, "Background sync cancelled while retrying");
            }
            Ok(outcome) => self.confirm(&outcome),
            Err(failure) => {
                self.rollback(&failure.operation);
                self.emit(RepositoryEvent::error(
                    "backgroundSync",
                    &failure.error,
                    Some(failure.operation.key.to_string()),
                ));
            }
        }
    }

    /// Push every pending operation now, regardless of strategy.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let store = self.store()?;
        let ids = lock(&self.inner.registry).ids();
        if ids.is_empty() {
            return Ok(SyncReport::default());
        }

        let operation_count = ids.len();
        self.set_state(RepositoryState::Syncing);
        self.emit(RepositoryEvent::SyncStarted { operation_count });
        diag!(self.logging(), info, operations = operation_count, "Syncing pending operations");

        let timers: Vec<_> = {
            let mut registry = lock(&self.inner.registry);
            ids.iter().filter_map(|id| registry.take_timer(id)).collect()
        };
        for timer in timers {
            self.inner.scheduler.cancel(timer);
        }

        let results = join_all(
            ids.iter()
                .map(|id| self.inner.engine.run(store.as_ref(), id)),
        )
        .await;

        let mut report = SyncReport {
            operation_count,
            ..SyncReport::default()
        };
        let mut failures: Vec<SyncFailure> = Vec::new();
        let mut cancelled: Vec<SyncFailure> = Vec::new();
        for result in results {
            match result {
                Ok(outcome @ SyncOutcome::Synced(_)) => {
                    self.confirm(&outcome);
                    report.synced += 1;
                }
                Ok(SyncOutcome::Superseded) => report.superseded += 1,
                Ok(SyncOutcome::Cancelled(operation)) => {
                    if let Some(error) = operation.last_error.clone() {
                        cancelled.push(SyncFailure { operation, error });
                    }
                }
                Err(failure) => failures.push(failure),
            }
        }

        // Rolled back here; cancelled runs were already reset by cleanup
        for failure in &failures {
            self.rollback(&failure.operation);
        }
        failures.extend(cancelled);

        if failures.is_empty() {
            self.set_state(RepositoryState::Idle);
            self.emit(RepositoryEvent::SyncCompleted { operation_count });
            diag!(self.logging(), info, synced = report.synced, "Sync completed");
            return Ok(report);
        }

        diag!(self.logging(), warn, failed = failures.len(), operations = operation_count, "Sync failed");
        self.set_state(RepositoryState::Error);
        self.emit(RepositoryEvent::SyncFailed {
            failures: failures.clone(),
        });
        self.emit(RepositoryEvent::error(
            "syncAll",
            format!("{} operation(s) failed", failures.len()),
            None,
        ));
        Err(RepositoryError::SyncFailed(failures))
    }

    // ========================================================================
    // Confirmation and rollback
    // ========================================================================

    /// Apply a confirmed non-optimistic write to the cache. Optimistic writes
    /// are already there.
    fn confirm(&self, outcome: &SyncOutcome) {
        let SyncOutcome::Synced(op) = outcome else {
            return;
        };
        if op.optimistic {
            return;
        }

        match op.kind {
            OperationKind::Create | OperationKind::Update => {
                let Some(data) = op.data.clone() else {
                    return;
                };
                if let Some(previous) = &op.previous_key {
                    self.cache_remove(previous);
                }
                self.cache_set(op.key.clone(), data.clone());
                if op.kind == OperationKind::Create {
                    self.emit(RepositoryEvent::RecipeCreated(data));
                } else {
                    self.emit(RepositoryEvent::RecipeUpdated(data));
                }
            }
            OperationKind::Delete => {
                self.cache_remove(&op.key);
                self.emit(RepositoryEvent::RecipeDeleted {
                    key: op.key.clone(),
                    data: op.original_data.clone(),
                });
            }
        }
        self.emit_recipes_updated();
    }

    /// Undo the optimistic cache change of an abandoned operation.
    ///
    /// When a newer optimistic operation on the same key is still queued the
    /// cache already shows that newer intent. The abandoned operation's
    /// `original_data` is handed to it instead, so if it fails as well its
    /// rollback restores what the remote store still holds.
    fn rollback(&self, op: &PendingOperation) {
        if !op.optimistic {
            return;
        }

        let inherited_by = {
            let mut registry = lock(&self.inner.registry);
            registry
                .hand_down_original(&op.key, op.original_data.clone())
                .or_else(|| registry.hand_down_original(op.source_key(), op.original_data.clone()))
        };
        if let Some(next) = inherited_by {
            diag!(
                self.logging(),
                debug,
                key = %op.key,
                operation = %op.kind,
                next = %next,
                "Newer operation pending, handing rollback state to it"
            );
            return;
        }

        match op.kind {
            OperationKind::Create => {
                self.cache_remove(&op.key);
                if let Some(original) = &op.original_data {
                    self.cache_set(op.key.clone(), original.clone());
                }
            }
            OperationKind::Update => {
                self.cache_remove(&op.key);
                if let Some(original) = &op.original_data {
                    self.cache_set(op.source_key().clone(), original.clone());
                }
            }
            OperationKind::Delete => {
                if let Some(original) = &op.original_data {
                    self.cache_set(op.key.clone(), original.clone());
                }
            }
        }

        diag!(self.logging(), info, key = %op.key, operation = %op.kind, "Rolled back optimistic change");
        self.emit(RepositoryEvent::RolledBack {
            operation: op.kind,
            key: op.key.clone(),
        });
        self.emit_recipes_updated();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop every cached entry. Pending operations are kept.
    pub fn clear_cache(&self) {
        lock(&self.inner.cache).clear();
        self.emit(RepositoryEvent::CacheUpdated(CacheChange::Cleared));
    }

    /// Cancel all timers (including syncs already talking to the store),
    /// forget pending operations and cached data, and return to `Idle`.
    pub fn cleanup(&self) {
        let cancelled = self.inner.scheduler.cancel_all();
        let dropped = {
            let mut registry = lock(&self.inner.registry);
            let count = registry.len();
            registry.clear();
            count
        };
        lock(&self.inner.cache).clear();
        self.inner.engine.reset();
        self.set_state(RepositoryState::Idle);
        self.emit(RepositoryEvent::CacheUpdated(CacheChange::Cleared));
        diag!(self.logging(), info, timers = cancelled, operations = dropped, "Repository cleaned up");
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn store(&self) -> Result<Arc<dyn RemoteStore>> {
        self.inner
            .store
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(RepositoryError::NotConfigured)
    }

    fn logging(&self) -> bool {
        self.inner.config.enable_logging
    }

    fn emit(&self, event: RepositoryEvent) {
        self.inner.events.emit(event);
    }

    fn emit_recipes_updated(&self) {
        let recipes = lock(&self.inner.cache).all();
        self.emit(RepositoryEvent::RecipesUpdated(recipes));
    }

    fn set_state(&self, current: RepositoryState) {
        let previous = std::mem::replace(&mut *lock(&self.inner.state), current);
        if previous != current {
            self.emit(RepositoryEvent::StateChanged { previous, current });
        }
    }

    fn cache_set(&self, key: Key, recipe: Recipe) {
        lock(&self.inner.cache).set(key.clone(), recipe);
        self.emit(RepositoryEvent::CacheUpdated(CacheChange::Added(key)));
    }

    fn cache_remove(&self, key: &Key) -> Option<Recipe> {
        let removed = lock(&self.inner.cache).remove(key);
        if removed.is_some() {
            self.emit(RepositoryEvent::CacheUpdated(CacheChange::Removed(key.clone())));
        }
        removed
    }
}
