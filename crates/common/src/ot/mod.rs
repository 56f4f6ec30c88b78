// Operational-transform data model for tabular documents.
//
// Operations carry a JSON0-style payload: each component addresses a path
// inside the document data and inserts (`oi`) and/or deletes (`od`) a value.
// Object keys get last-writer-wins overwrites; list indices shift.

mod apply;
mod query;
mod transform;

pub use apply::apply_components;
pub use query::{Query, QueryResult, SortField, SortOrder};
pub use transform::transform;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while applying or transforming operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtError {
    #[error("component at {path} has neither `oi` nor `od`")]
    EmptyComponent { path: String },
    #[error("operation has no payload, create, or delete")]
    EmptyOperation,
    #[error("operation mixes create/delete with edit components")]
    MixedOperation,
    #[error("path {path} does not exist")]
    MissingPath { path: String },
    #[error("path {path} does not address a {expected}")]
    TypeMismatch { path: String, expected: &'static str },
    #[error("index {index} out of bounds at {path} (len {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },
    #[error("document already exists")]
    DocumentExists,
    #[error("document has been deleted")]
    DocumentDeleted,
    #[error("document does not exist")]
    DocumentMissing,
}

/// One step of a path into document data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    pub fn key(value: impl Into<String>) -> Self {
        Self::Key(value.into())
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            Self::Key(_) => None,
        }
    }
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Key(key) => f.write_str(key),
        }
    }
}

pub(crate) fn display_path(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}

/// What an [`EditComponent`] does, derived from its path and fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// Replace the whole document value (empty path with `oi`).
    ReplaceRoot,
    ObjectSet,
    ObjectDelete,
    ListInsert,
    ListDelete,
    ListReplace,
}

impl ComponentKind {
    /// Scalar writes are resolved last-writer-wins when two land on one path.
    pub fn is_overwrite(self) -> bool {
        matches!(self, Self::ReplaceRoot | Self::ObjectSet | Self::ObjectDelete | Self::ListReplace)
    }
}

/// A single JSON0-style edit: `{p, oi?, od?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditComponent {
    pub p: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub od: Option<Value>,
}

impl EditComponent {
    /// `p = value` on an object key.
    pub fn set(path: Vec<PathSegment>, value: Value) -> Self {
        Self { p: path, oi: Some(value), od: None }
    }

    /// Set a top-level field: the common case for record cells.
    pub fn set_field(field: &str, value: Value) -> Self {
        Self::set(vec![PathSegment::key(field)], value)
    }

    pub fn delete(path: Vec<PathSegment>, previous: Value) -> Self {
        Self { p: path, oi: None, od: Some(previous) }
    }

    pub fn kind(&self) -> Result<ComponentKind, OtError> {
        match (self.p.last(), self.oi.is_some(), self.od.is_some()) {
            (_, false, false) => Err(OtError::EmptyComponent { path: display_path(&self.p) }),
            (None, true, _) => Ok(ComponentKind::ReplaceRoot),
            (None, false, true) => Err(OtError::TypeMismatch {
                path: display_path(&self.p),
                expected: "deletable value",
            }),
            (Some(PathSegment::Key(_)), true, _) => Ok(ComponentKind::ObjectSet),
            (Some(PathSegment::Key(_)), false, true) => Ok(ComponentKind::ObjectDelete),
            (Some(PathSegment::Index(_)), true, false) => Ok(ComponentKind::ListInsert),
            (Some(PathSegment::Index(_)), false, true) => Ok(ComponentKind::ListDelete),
            (Some(PathSegment::Index(_)), true, true) => Ok(ComponentKind::ListReplace),
        }
    }
}

/// Payload of a document-creating operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateData {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// An operation as submitted by a client.
///
/// Field aliases accept the raw ShareDB shape (`v`, `op`, `src`, `del`) so
/// existing clients can submit without translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub collection: String,
    #[serde(default, alias = "d", alias = "id")]
    pub document_id: String,
    #[serde(alias = "v", default)]
    pub base_version: u64,
    #[serde(alias = "op", default)]
    pub payload: Vec<EditComponent>,
    #[serde(alias = "src", default)]
    pub source: String,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<CreateData>,
    #[serde(alias = "del", default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
}

impl Operation {
    pub fn edit(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        base_version: u64,
        payload: Vec<EditComponent>,
    ) -> Self {
        Self {
            collection: collection.into(),
            document_id: document_id.into(),
            base_version,
            payload,
            source: String::new(),
            submitted_at: Utc::now(),
            create: None,
            delete: false,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.submitted_at = submitted_at;
        self
    }

    /// Checks the payload shape without touching any snapshot.
    pub fn validate(&self) -> Result<(), OtError> {
        self.check_shape(false)
    }

    /// A rebase may strip every component from an edit. Such an edit is
    /// still committed so the version advances.
    pub fn is_noop(&self) -> bool {
        self.payload.is_empty() && self.create.is_none() && !self.delete
    }

    fn check_shape(&self, allow_noop: bool) -> Result<(), OtError> {
        let has_edits = !self.payload.is_empty();
        match (self.create.is_some(), self.delete, has_edits) {
            (false, false, false) if allow_noop => {}
            (false, false, false) => return Err(OtError::EmptyOperation),
            (true, true, _) | (true, _, true) | (_, true, true) => {
                return Err(OtError::MixedOperation)
            }
            _ => {}
        }
        for component in &self.payload {
            component.kind()?;
        }
        Ok(())
    }

    /// `(submitted_at, source)` ordering used for last-writer-wins.
    pub(crate) fn precedence(&self) -> (DateTime<Utc>, &str) {
        (self.submitted_at, self.source.as_str())
    }
}

/// Materialized document state at a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub version: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_DOC_TYPE: &str = "json0";

impl Snapshot {
    /// The version-0 placeholder for a document that was never committed.
    pub fn missing(id: impl Into<String>) -> Self {
        Self { id: id.into(), version: 0, doc_type: None, data: Value::Null, deleted_at: None }
    }

    pub fn exists(&self) -> bool {
        self.version > 0 && self.deleted_at.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Applies `operation` and returns the next snapshot at `version + 1`.
    ///
    /// The current snapshot is untouched on error.
    pub fn apply(&self, operation: &Operation) -> Result<Snapshot, OtError> {
        operation.check_shape(true)?;
        let mut next = self.clone();
        next.version = self.version + 1;

        if let Some(create) = &operation.create {
            if self.exists() {
                return Err(OtError::DocumentExists);
            }
            next.doc_type =
                Some(create.doc_type.clone().unwrap_or_else(|| DEFAULT_DOC_TYPE.to_string()));
            next.data = create.data.clone();
            next.deleted_at = None;
            return Ok(next);
        }

        if self.is_deleted() {
            // Repeated deletes collapse to a version bump.
            return if operation.delete { Ok(next) } else { Err(OtError::DocumentDeleted) };
        }

        if operation.delete {
            if self.version == 0 {
                return Err(OtError::DocumentMissing);
            }
            next.deleted_at = Some(operation.submitted_at);
            return Ok(next);
        }

        if self.version == 0 {
            next.doc_type = Some(DEFAULT_DOC_TYPE.to_string());
            next.data = Value::Object(Default::default());
        }
        apply_components(&mut next.data, &operation.payload)?;
        Ok(next)
    }
}

/// An operation after commit, stamped with the version it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedOperation {
    pub committed_version: u64,
    pub operation: Operation,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn component_kind_follows_last_segment() {
        let set = EditComponent::set_field("fld1", json!(1));
        assert_eq!(set.kind(), Ok(ComponentKind::ObjectSet));

        let insert = EditComponent {
            p: vec![PathSegment::key("tags"), PathSegment::Index(0)],
            oi: Some(json!("a")),
            od: None,
        };
        assert_eq!(insert.kind(), Ok(ComponentKind::ListInsert));

        let replace = EditComponent { od: Some(json!("b")), ..insert.clone() };
        assert_eq!(replace.kind(), Ok(ComponentKind::ListReplace));

        let empty = EditComponent { p: vec![PathSegment::key("x")], oi: None, od: None };
        assert!(matches!(empty.kind(), Err(OtError::EmptyComponent { .. })));
    }

    #[test]
    fn raw_sharedb_shape_deserializes() {
        let raw = json!({
            "src": "agent-1",
            "v": 3,
            "op": [{ "p": ["fields", "fld1"], "oi": "hello" }, { "p": ["order", 2], "od": 7 }]
        });
        let operation: Operation = serde_json::from_value(raw).expect("raw op should parse");
        assert_eq!(operation.base_version, 3);
        assert_eq!(operation.source, "agent-1");
        assert_eq!(operation.payload[0].p, vec![PathSegment::key("fields"), PathSegment::key("fld1")]);
        assert_eq!(operation.payload[1].p[1], PathSegment::Index(2));
        assert!(!operation.delete);
    }

    #[test]
    fn validate_rejects_empty_and_mixed_operations() {
        let empty = Operation::edit("rec_t1", "r1", 0, vec![]);
        assert_eq!(empty.validate(), Err(OtError::EmptyOperation));

        let mut mixed = Operation::edit("rec_t1", "r1", 0, vec![EditComponent::set_field("a", json!(1))]);
        mixed.delete = true;
        assert_eq!(mixed.validate(), Err(OtError::MixedOperation));
    }

    #[test]
    fn stripped_edit_still_bumps_the_version() {
        let base = Snapshot::missing("r1")
            .apply(&Operation::edit("rec_t1", "r1", 0, vec![EditComponent::set_field("a", json!(1))]))
            .expect("seed");
        let stripped = Operation::edit("rec_t1", "r1", 1, vec![]);
        assert!(stripped.is_noop());
        let next = base.apply(&stripped).expect("no-op should apply");
        assert_eq!(next.version, 2);
        assert_eq!(next.data, base.data);
    }

    #[test]
    fn edit_on_missing_document_materializes_it() {
        let snapshot = Snapshot::missing("r1");
        let op = Operation::edit("rec_t1", "r1", 0, vec![EditComponent::set_field("a", json!(1))]);
        let next = snapshot.apply(&op).expect("apply should succeed");
        assert_eq!(next.version, 1);
        assert_eq!(next.data, json!({ "a": 1 }));
        assert_eq!(next.doc_type.as_deref(), Some(DEFAULT_DOC_TYPE));
    }

    #[test]
    fn create_then_delete_lifecycle() {
        let mut create = Operation::edit("rec_t1", "r1", 0, vec![]);
        create.create = Some(CreateData { doc_type: None, data: json!({ "name": "x" }) });
        let created = Snapshot::missing("r1").apply(&create).expect("create should apply");
        assert!(created.exists());
        assert_eq!(created.apply(&create), Err(OtError::DocumentExists));

        let mut delete = Operation::edit("rec_t1", "r1", 1, vec![]);
        delete.delete = true;
        let deleted = created.apply(&delete).expect("delete should apply");
        assert!(deleted.is_deleted());
        assert_eq!(deleted.version, 2);

        let edit = Operation::edit("rec_t1", "r1", 2, vec![EditComponent::set_field("a", json!(1))]);
        assert_eq!(deleted.apply(&edit), Err(OtError::DocumentDeleted));
        assert_eq!(deleted.apply(&delete).map(|s| s.version), Ok(3));
    }
}
