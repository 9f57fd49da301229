//! Write-behind synchronization with the remote store.
//!
//! - `PendingRegistry`: queued create/update/delete intents with retry state
//! - `Scheduler`: injectable timer service for delayed syncs
//! - `SyncEngine`: runs one operation against the store with bounded,
//!   exponentially backed-off retries and per-key ordering

pub mod engine;
pub mod operation;
pub mod registry;
pub mod scheduler;

pub use engine::{backoff, SyncEngine, SyncOutcome};
pub use operation::{OperationId, OperationKind, PendingOperation, SyncFailure};
pub use registry::{PendingRegistry, Registration};
pub use scheduler::{Scheduler, TimerId, TimerTask, TokioScheduler};
