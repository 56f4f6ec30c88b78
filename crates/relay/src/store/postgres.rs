use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tablesync_common::ot::{CommittedOperation, Operation, Snapshot};

use super::{CasOutcome, StoreError};

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    doc_id: String,
    version: i64,
    doc_type: Option<String>,
    data: Value,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<SnapshotRow> for Snapshot {
    fn from(row: SnapshotRow) -> Self {
        Snapshot {
            id: row.doc_id,
            version: u64::try_from(row.version).unwrap_or_default(),
            doc_type: row.doc_type,
            data: row.data,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OpRow {
    version: i64,
    op: Value,
}

fn to_i64(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::VersionOverflow(version))
}

pub(super) async fn load(pool: &PgPool, collection: &str, document_id: &str) -> Result<Snapshot, StoreError> {
    let row = sqlx::query_as::<_, SnapshotRow>(
        r#"
        SELECT doc_id, version, doc_type, data, deleted_at
        FROM ot_snapshots
        WHERE collection = $1 AND doc_id = $2
        "#,
    )
    .bind(collection)
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Snapshot::from).unwrap_or_else(|| Snapshot::missing(document_id)))
}

pub(super) async fn ops_range(
    pool: &PgPool,
    collection: &str,
    document_id: &str,
    from: u64,
    to: u64,
) -> Result<Vec<CommittedOperation>, StoreError> {
    let to = i64::try_from(to).unwrap_or(i64::MAX);
    let rows = sqlx::query_as::<_, OpRow>(
        r#"
        SELECT version, op
        FROM ot_ops
        WHERE collection = $1 AND doc_id = $2 AND version > $3 AND version <= $4
        ORDER BY version ASC
        "#,
    )
    .bind(collection)
    .bind(document_id)
    .bind(to_i64(from)?)
    .bind(to)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let operation: Operation =
                serde_json::from_value(row.op).map_err(|source| StoreError::Corrupt {
                    what: "operation",
                    collection: collection.to_string(),
                    document_id: document_id.to_string(),
                    source,
                })?;
            Ok(CommittedOperation {
                committed_version: u64::try_from(row.version).unwrap_or_default(),
                operation,
            })
        })
        .collect()
}

pub(super) async fn compare_and_swap(
    pool: &PgPool,
    collection: &str,
    expected: u64,
    next: &Snapshot,
    op: &CommittedOperation,
) -> Result<CasOutcome, StoreError> {
    let op_json = serde_json::to_value(&op.operation).map_err(|source| StoreError::Corrupt {
        what: "operation",
        collection: collection.to_string(),
        document_id: next.id.clone(),
        source,
    })?;

    let mut tx = pool.begin().await?;

    let written = if expected == 0 {
        sqlx::query(
            r#"
            INSERT INTO ot_snapshots (collection, doc_id, version, doc_type, data, deleted_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (collection, doc_id) DO NOTHING
            "#,
        )
        .bind(collection)
        .bind(&next.id)
        .bind(to_i64(next.version)?)
        .bind(&next.doc_type)
        .bind(&next.data)
        .bind(next.deleted_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
    } else {
        sqlx::query(
            r#"
            UPDATE ot_snapshots
            SET version = $3, doc_type = $4, data = $5, deleted_at = $6, updated_at = now()
            WHERE collection = $1 AND doc_id = $2 AND version = $7
            "#,
        )
        .bind(collection)
        .bind(&next.id)
        .bind(to_i64(next.version)?)
        .bind(&next.doc_type)
        .bind(&next.data)
        .bind(next.deleted_at)
        .bind(to_i64(expected)?)
        .execute(&mut *tx)
        .await?
        .rows_affected()
    };

    if written == 0 {
        tx.rollback().await?;
        let current = load(pool, collection, &next.id).await?;
        return Ok(CasOutcome::Conflict { current });
    }

    sqlx::query(
        r#"
        INSERT INTO ot_ops (collection, doc_id, version, op, created_at)
        VALUES ($1, $2, $3, $4, now())
        "#,
    )
    .bind(collection)
    .bind(&next.id)
    .bind(to_i64(op.committed_version)?)
    .bind(op_json)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(CasOutcome::Committed)
}

pub(super) async fn list_collection(pool: &PgPool, collection: &str) -> Result<Vec<Snapshot>, StoreError> {
    let rows = sqlx::query_as::<_, SnapshotRow>(
        r#"
        SELECT doc_id, version, doc_type, data, deleted_at
        FROM ot_snapshots
        WHERE collection = $1
        ORDER BY doc_id
        "#,
    )
    .bind(collection)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Snapshot::from).collect())
}

pub(super) async fn document_counts(pool: &PgPool) -> Result<HashMap<String, u64>, StoreError> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT collection, COUNT(*) FROM ot_snapshots GROUP BY collection",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(collection, count)| (collection, u64::try_from(count).unwrap_or_default()))
        .collect())
}
