// Submission pipeline: validate, authorize, rebase, apply, commit by CAS,
// then fan the commit out.
//
// Attempts on one document are serialized by an in-process lock. The CAS
// still guards against writers in other relay instances.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tablesync_common::channel::{resource_for_document, Channel, ResourceType};
use tablesync_common::ot::{
    transform, CommittedOperation, Operation, OtError, Query, QueryResult, Snapshot,
};
use tracing::{debug, info_span, warn, Instrument};

use super::DocLocks;
use crate::config::SubmitConfig;
use crate::error::{ErrorCode, RelayError};
use crate::metrics;
use crate::permissions::{PermissionChecker, ACTION_WRITE};
use crate::pubsub::{Event, FanOut};
use crate::store::{CasOutcome, OpLogStore, StoreError};

const MAX_IDENTIFIER_BYTES: usize = 128;
pub const MAX_BULK_SNAPSHOT_IDS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOutcome {
    pub committed_version: u64,
    pub snapshot: Snapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),
    #[error("base version {base} is ahead of current version {current}")]
    InvalidVersion { base: u64, current: u64 },
    #[error("gave up after {attempts} conflicting commit attempts")]
    ConflictExhausted { attempts: u32 },
    #[error("user {user_id} may not write {resource_type} {resource_id}")]
    PermissionDenied { user_id: String, resource_type: ResourceType, resource_id: String },
    #[error("operation rejected: {0}")]
    Transform(#[from] OtError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("permission check failed: {0}")]
    PermissionBackend(#[source] sqlx::Error),
    #[error("submission did not finish within {0:?}")]
    Timeout(Duration),
}

impl SubmitError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::InvalidVersion { .. } => ErrorCode::InvalidVersion,
            Self::ConflictExhausted { .. } => ErrorCode::ConflictExhausted,
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::Transform(_) => ErrorCode::TransformError,
            Self::Store(_) | Self::PermissionBackend(_) => ErrorCode::InternalError,
            Self::Timeout(_) => ErrorCode::SubmitTimeout,
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transform(_) => "transform_error",
            Self::InvalidVersion { .. } => "invalid_version",
            Self::ConflictExhausted { .. } => "conflict_exhausted",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Store(_) | Self::PermissionBackend(_) => "transport_error",
            Self::Timeout(_) => "timeout",
        }
    }
}

impl From<SubmitError> for RelayError {
    fn from(error: SubmitError) -> Self {
        match error.code() {
            ErrorCode::InternalError => {
                tracing::error!(error = %error, "submission failed on a backend");
                RelayError::from_code(ErrorCode::InternalError)
            }
            code => RelayError::new(code, error.to_string()),
        }
    }
}

pub struct SubmitPipeline {
    store: OpLogStore,
    permissions: PermissionChecker,
    fan_out: FanOut,
    locks: Arc<DocLocks>,
    config: SubmitConfig,
}

impl SubmitPipeline {
    pub fn new(
        store: OpLogStore,
        permissions: PermissionChecker,
        fan_out: FanOut,
        locks: Arc<DocLocks>,
        config: SubmitConfig,
    ) -> Self {
        Self { store, permissions, fan_out, locks, config }
    }

    pub fn store(&self) -> &OpLogStore {
        &self.store
    }

    /// Commits `operation` on behalf of `user_id`.
    ///
    /// Runs under the configured deadline; dropping the future cancels it.
    /// A failed submission never leaves a partial commit behind.
    pub async fn submit(&self, user_id: &str, operation: Operation) -> Result<SubmitOutcome, SubmitError> {
        let deadline = self.config.timeout;
        let span = info_span!(
            "tablesync.pipeline.submit",
            collection = %operation.collection,
            document_id = %operation.document_id,
            base_version = operation.base_version,
            user_id = %user_id,
        );

        let result = match tokio::time::timeout(deadline, self.submit_inner(user_id, operation))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Timeout(deadline)),
        };

        match &result {
            Ok(_) => metrics::record_submit_outcome("committed"),
            Err(error) => metrics::record_submit_outcome(error.outcome_label()),
        }
        result
    }

    async fn submit_inner(&self, user_id: &str, operation: Operation) -> Result<SubmitOutcome, SubmitError> {
        validate_identifier("collection", &operation.collection)?;
        validate_identifier("document id", &operation.document_id)?;
        operation.validate()?;
        self.authorize(user_id, &operation).await?;

        let lock = self.locks.handle(&operation.collection, &operation.document_id);
        let _held = lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.store.load(&operation.collection, &operation.document_id).await?;
            let (next, committed) = self.prepare(&operation, &current).await?;

            match self
                .store
                .compare_and_swap(&operation.collection, current.version, &next, &committed)
                .await?
            {
                CasOutcome::Committed => {
                    debug!(committed_version = next.version, attempt, noop = committed.operation.is_noop(), "operation committed");
                    self.publish_commit(&committed).await;
                    return Ok(SubmitOutcome { committed_version: next.version, snapshot: next });
                }
                CasOutcome::Conflict { current } => {
                    if attempt >= self.config.max_attempts {
                        warn!(attempt, current_version = current.version, "commit conflicts exhausted");
                        return Err(SubmitError::ConflictExhausted { attempts: attempt });
                    }
                    metrics::increment_cas_retries();
                    let delay = backoff_delay(&self.config, attempt);
                    debug!(attempt, current_version = current.version, delay_ms = delay.as_millis() as u64, "commit conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn authorize(&self, user_id: &str, operation: &Operation) -> Result<(), SubmitError> {
        let (resource_type, resource_id) =
            resource_for_document(&operation.collection, &operation.document_id);
        let allowed = self
            .permissions
            .check(user_id, &resource_type, &resource_id, ACTION_WRITE)
            .await
            .map_err(SubmitError::PermissionBackend)?;
        if allowed {
            Ok(())
        } else {
            Err(SubmitError::PermissionDenied { user_id: user_id.to_string(), resource_type, resource_id })
        }
    }

    /// Rebases `operation` onto `current` and computes the next snapshot.
    async fn prepare(
        &self,
        operation: &Operation,
        current: &Snapshot,
    ) -> Result<(Snapshot, CommittedOperation), SubmitError> {
        if operation.base_version > current.version {
            return Err(SubmitError::InvalidVersion { base: operation.base_version, current: current.version });
        }

        let mut rebased = if operation.base_version < current.version {
            let since = self
                .store
                .ops_range(&operation.collection, &operation.document_id, operation.base_version, current.version)
                .await?;
            let committed: Vec<Operation> = since.into_iter().map(|op| op.operation).collect();
            transform(operation, &committed)?
        } else {
            operation.clone()
        };
        rebased.base_version = current.version;

        let next = current.apply(&rebased)?;
        let committed = CommittedOperation { committed_version: next.version, operation: rebased };
        Ok((next, committed))
    }

    async fn publish_commit(&self, committed: &CommittedOperation) {
        let operation = &committed.operation;
        for channel in Channel::for_document(&operation.collection, &operation.document_id) {
            let topic = channel.to_string();
            let event = Event::Committed {
                collection: operation.collection.clone(),
                document_id: operation.document_id.clone(),
                committed_version: committed.committed_version,
                operation: operation.clone(),
            };
            if let Err(publish_error) = self.fan_out.publish(&topic, event).await {
                warn!(error = %publish_error, topic = %topic, "commit fan-out failed");
            }
        }
    }

    pub async fn snapshot(&self, collection: &str, document_id: &str) -> Result<Snapshot, SubmitError> {
        validate_identifier("collection", collection)?;
        validate_identifier("document id", document_id)?;
        Ok(self.store.load(collection, document_id).await?)
    }

    /// Head snapshots for `ids`, keyed by id. Unknown documents come back as
    /// the version-0 placeholder and repeated ids are read once.
    pub async fn snapshots(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<BTreeMap<String, Snapshot>, SubmitError> {
        validate_identifier("collection", collection)?;
        if ids.len() > MAX_BULK_SNAPSHOT_IDS {
            return Err(SubmitError::Validation(format!(
                "at most {MAX_BULK_SNAPSHOT_IDS} ids per bulk read, got {}",
                ids.len()
            )));
        }
        for id in ids {
            validate_identifier("document id", id)?;
        }

        let mut snapshots = BTreeMap::new();
        for id in ids {
            if !snapshots.contains_key(id) {
                let snapshot = self.store.load(collection, id).await?;
                snapshots.insert(id.clone(), snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Committed ops with `from < committed_version <= to`; `to == 0` is the head.
    pub async fn ops(
        &self,
        collection: &str,
        document_id: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<CommittedOperation>, SubmitError> {
        validate_identifier("collection", collection)?;
        validate_identifier("document id", document_id)?;
        if to != 0 && from > to {
            return Err(SubmitError::Validation(format!("`from` ({from}) must not exceed `to` ({to})")));
        }
        Ok(self.store.ops_range(collection, document_id, from, to).await?)
    }

    pub async fn query(&self, collection: &str, query: &Query) -> Result<QueryResult, SubmitError> {
        validate_identifier("collection", collection)?;
        let snapshots = self.store.list_collection(collection).await?;
        Ok(query.run(snapshots))
    }
}

fn validate_identifier(what: &str, value: &str) -> Result<(), SubmitError> {
    if value.is_empty() {
        return Err(SubmitError::Validation(format!("{what} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_BYTES {
        return Err(SubmitError::Validation(format!("{what} exceeds {MAX_IDENTIFIER_BYTES} bytes")));
    }
    if !value.bytes().all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-') {
        return Err(SubmitError::Validation(format!("{what} `{value}` contains invalid characters")));
    }
    Ok(())
}

/// Exponential backoff with jitter in `[delay/2, delay]`.
fn backoff_delay(config: &SubmitConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let full = config.backoff_base.saturating_mul(1 << exponent).min(config.backoff_max);
    let full_ms = full.as_millis() as u64;
    if full_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(full_ms / 2..=full_ms))
}
