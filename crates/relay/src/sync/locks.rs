use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocKey {
    collection: String,
    document_id: String,
}

/// One async mutex per document so attempts on a document run one at a
/// time while unrelated documents never contend.
#[derive(Debug, Default)]
pub struct DocLocks {
    locks: Mutex<HashMap<DocKey, Arc<AsyncMutex<()>>>>,
}

impl DocLocks {
    pub fn handle(&self, collection: &str, document_id: &str) -> Arc<AsyncMutex<()>> {
        let key = DocKey { collection: collection.to_string(), document_id: document_id.to_string() };
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key).or_default())
    }

    /// Drops entries nobody holds or waits on. Returns how many went.
    pub fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
