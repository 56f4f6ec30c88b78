use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

/// Snapshot query over one collection.
///
/// `fields` is an equality filter keyed by dotted data paths
/// (`"fields.fld1"`). `limit == 0` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub skip: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub snapshots: Vec<Snapshot>,
    /// Matches before `skip`/`limit` were applied.
    pub total: usize,
}

impl Query {
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        snapshot.exists()
            && self
                .fields
                .iter()
                .all(|(path, expected)| lookup(&snapshot.data, path) == Some(expected))
    }

    /// Filters, sorts and pages `snapshots`. Ties fall back to document id so
    /// paging is stable.
    pub fn run(&self, snapshots: impl IntoIterator<Item = Snapshot>) -> QueryResult {
        let mut matched: Vec<Snapshot> =
            snapshots.into_iter().filter(|snapshot| self.matches(snapshot)).collect();

        matched.sort_by(|left, right| {
            self.sort
                .iter()
                .map(|sort| {
                    let ordering = compare_values(
                        lookup(&left.data, &sort.field),
                        lookup(&right.data, &sort.field),
                    );
                    match sort.order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| left.id.cmp(&right.id))
        });

        let total = matched.len();
        let limit = if self.limit == 0 { usize::MAX } else { self.limit };
        let snapshots = matched.into_iter().skip(self.skip).take(limit).collect();
        QueryResult { snapshots, total }
    }
}

fn lookup<'a>(data: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::Bool(l)), Some(Value::Bool(r))) => l.cmp(r),
        (Some(Value::Number(l)), Some(Value::Number(r))) => {
            let l = l.as_f64().unwrap_or(f64::NAN);
            let r = r.as_f64().unwrap_or(f64::NAN);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(l)), Some(Value::String(r))) => l.cmp(r),
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}
