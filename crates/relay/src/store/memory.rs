use std::collections::HashMap;

use tablesync_common::ot::{CommittedOperation, Snapshot};

use super::CasOutcome;

struct DocumentRecord {
    snapshot: Snapshot,
    ops: Vec<CommittedOperation>,
}

/// Process-local op log used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryOpLog {
    documents: HashMap<(String, String), DocumentRecord>,
    /// Test-only: another writer commits just before every swap.
    #[cfg(test)]
    rival_writer: bool,
}

impl MemoryOpLog {
    #[cfg(test)]
    pub(crate) fn with_rival_writer() -> Self {
        Self { rival_writer: true, ..Self::default() }
    }

    pub(super) fn load(&self, collection: &str, document_id: &str) -> Snapshot {
        self.documents
            .get(&(collection.to_string(), document_id.to_string()))
            .map(|record| record.snapshot.clone())
            .unwrap_or_else(|| Snapshot::missing(document_id))
    }

    pub(super) fn ops_range(
        &self,
        collection: &str,
        document_id: &str,
        from: u64,
        to: u64,
    ) -> Vec<CommittedOperation> {
        let Some(record) = self.documents.get(&(collection.to_string(), document_id.to_string()))
        else {
            return Vec::new();
        };
        // ops[i] produced version i + 1.
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(record.ops.len());
        let end = usize::try_from(to).unwrap_or(usize::MAX).min(record.ops.len());
        record.ops[start..end.max(start)].to_vec()
    }

    pub(super) fn compare_and_swap(
        &mut self,
        collection: &str,
        expected: u64,
        next: &Snapshot,
        op: &CommittedOperation,
    ) -> CasOutcome {
        let record = self
            .documents
            .entry((collection.to_string(), next.id.clone()))
            .or_insert_with(|| DocumentRecord { snapshot: Snapshot::missing(&next.id), ops: Vec::new() });

        #[cfg(test)]
        if self.rival_writer {
            rival_commit(collection, record);
        }

        if record.snapshot.version != expected {
            return CasOutcome::Conflict { current: record.snapshot.clone() };
        }
        record.snapshot = next.clone();
        record.ops.push(op.clone());
        CasOutcome::Committed
    }

    pub(super) fn list_collection(&self, collection: &str) -> Vec<Snapshot> {
        self.documents
            .iter()
            .filter(|((stored_collection, _), record)| {
                stored_collection == collection && record.snapshot.version > 0
            })
            .map(|(_, record)| record.snapshot.clone())
            .collect()
    }

    pub(super) fn document_counts(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for ((collection, _), record) in &self.documents {
            if record.snapshot.version > 0 {
                *counts.entry(collection.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
fn rival_commit(collection: &str, record: &mut DocumentRecord) {
    use tablesync_common::ot::{EditComponent, Operation};

    let version = record.snapshot.version;
    let rival = Operation::edit(
        collection,
        record.snapshot.id.clone(),
        version,
        vec![EditComponent::set_field("rival", serde_json::json!(version))],
    );
    if let Ok(next) = record.snapshot.apply(&rival) {
        record.ops.push(CommittedOperation { committed_version: next.version, operation: rival });
        record.snapshot = next;
    }
}
