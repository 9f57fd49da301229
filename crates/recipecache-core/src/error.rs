use thiserror::Error;

use crate::key::Key;
use crate::store::StoreError;
use crate::sync::{OperationKind, PendingOperation, SyncFailure};

#[derive(Error, Debug, Clone)]
pub enum RepositoryError {
    #[error("Remote store not configured - call set_store before loading or syncing")]
    NotConfigured,

    #[error("Failed to load recipes: {0}")]
    Load(#[source] StoreError),

    #[error("Failed to {operation} {key} after {attempts} attempt(s): {source}")]
    Sync {
        operation: OperationKind,
        key: Key,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("{operation} {key} was cancelled after {attempts} failed attempt(s)")]
    Cancelled {
        operation: OperationKind,
        key: Key,
        attempts: u32,
        #[source]
        last_error: Option<StoreError>,
    },

    #[error("{} operation(s) failed to sync", .0.len())]
    SyncFailed(Vec<SyncFailure>),
}

impl RepositoryError {
    /// Underlying store error for single-operation failures
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            RepositoryError::Load(e) => Some(e),
            RepositoryError::Sync { source, .. } => Some(source),
            RepositoryError::Cancelled { last_error, .. } => last_error.as_ref(),
            _ => None,
        }
    }
}

impl From<SyncFailure> for RepositoryError {
    fn from(failure: SyncFailure) -> Self {
        RepositoryError::Sync {
            operation: failure.operation.kind,
            key: failure.operation.key,
            attempts: failure.operation.attempts,
            source: failure.error,
        }
    }
}

impl RepositoryError {
    /// Error for an operation dropped mid-retry
    pub(crate) fn cancelled(operation: &PendingOperation) -> Self {
        RepositoryError::Cancelled {
            operation: operation.kind,
            key: operation.key.clone(),
            attempts: operation.attempts,
            last_error: operation.last_error.clone(),
        }
    }
}

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;
