// Durable snapshot + operation-log storage.
//
// Every write goes through `compare_and_swap`: the snapshot only advances
// when its stored version still equals the version the caller transformed
// against, and the committed op is appended in the same step.

mod memory;
mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tablesync_common::ot::{CommittedOperation, Snapshot};
use tokio::sync::RwLock;

pub use memory::MemoryOpLog;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored {what} for {collection}/{document_id} is not valid json: {source}")]
    Corrupt {
        what: &'static str,
        collection: String,
        document_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("version {0} does not fit the storage column")]
    VersionOverflow(u64),
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Committed,
    /// The stored head moved on; `current` is what is there now.
    Conflict { current: Snapshot },
}

#[derive(Clone)]
pub enum OpLogStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryOpLog>>),
}

impl OpLogStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryOpLog::default())))
    }

    /// Memory store where every swap loses to a concurrent commit.
    #[cfg(test)]
    pub(crate) fn memory_with_rival_writer() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryOpLog::with_rival_writer())))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    /// Head snapshot, or the version-0 placeholder when nothing was committed.
    pub async fn load(&self, collection: &str, document_id: &str) -> Result<Snapshot, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::load(pool, collection, document_id).await,
            Self::Memory(store) => Ok(store.read().await.load(collection, document_id)),
        }
    }

    /// Committed ops with `from < committed_version <= to`, ascending.
    /// `to == 0` reads through the head.
    pub async fn ops_range(
        &self,
        collection: &str,
        document_id: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<CommittedOperation>, StoreError> {
        let to = if to == 0 { u64::MAX } else { to };
        if from >= to {
            return Ok(Vec::new());
        }
        match self {
            Self::Postgres(pool) => postgres::ops_range(pool, collection, document_id, from, to).await,
            Self::Memory(store) => Ok(store.read().await.ops_range(collection, document_id, from, to)),
        }
    }

    /// Writes `next` and appends `op` iff the stored version is `expected`.
    pub async fn compare_and_swap(
        &self,
        collection: &str,
        expected: u64,
        next: &Snapshot,
        op: &CommittedOperation,
    ) -> Result<CasOutcome, StoreError> {
        debug_assert_eq!(next.version, expected + 1);
        debug_assert_eq!(op.committed_version, next.version);
        match self {
            Self::Postgres(pool) => postgres::compare_and_swap(pool, collection, expected, next, op).await,
            Self::Memory(store) => Ok(store.write().await.compare_and_swap(collection, expected, next, op)),
        }
    }

    /// Every stored snapshot in `collection`, deleted ones included.
    pub async fn list_collection(&self, collection: &str) -> Result<Vec<Snapshot>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::list_collection(pool, collection).await,
            Self::Memory(store) => Ok(store.read().await.list_collection(collection)),
        }
    }

    /// Document count per collection, for `/stats`.
    pub async fn document_counts(&self) -> Result<HashMap<String, u64>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::document_counts(pool).await,
            Self::Memory(store) => Ok(store.read().await.document_counts()),
        }
    }
}
