// Channel naming shared by clients and the relay.
//
// `table:<tableId>`, `record:<tableId>:<recordId>`, `view:<viewId>`.
// Collections follow the `<kind>_<tableId>` convention (`rec_tbl1`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const RECORD_COLLECTION_PREFIX: &str = "rec";
pub const VIEW_COLLECTION_PREFIX: &str = "viw";
pub const FIELD_COLLECTION_PREFIX: &str = "fld";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Table,
    Record,
    View,
}

impl ResourceType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Record => "record",
            Self::View => "view",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelParseError {
    #[error("unknown channel kind in `{0}`")]
    UnknownKind(String),
    #[error("malformed channel `{0}`")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Table(String),
    Record { table_id: String, record_id: String },
    View(String),
}

impl Channel {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Table(_) => ResourceType::Table,
            Self::Record { .. } => ResourceType::Record,
            Self::View(_) => ResourceType::View,
        }
    }

    /// Resource id used for presence and permission checks.
    pub fn resource_id(&self) -> String {
        match self {
            Self::Table(id) | Self::View(id) => id.clone(),
            Self::Record { table_id, record_id } => format!("{table_id}:{record_id}"),
        }
    }

    /// The document whose snapshot is replayed when a client joins.
    pub fn document(&self) -> Option<(String, String)> {
        match self {
            Self::Record { table_id, record_id } => {
                Some((format!("{RECORD_COLLECTION_PREFIX}_{table_id}"), record_id.clone()))
            }
            _ => None,
        }
    }

    /// Inverse of `(resource_type(), resource_id())`.
    pub fn for_resource(resource_type: &ResourceType, resource_id: &str) -> Option<Channel> {
        let raw = format!("{resource_type}:{resource_id}");
        raw.parse().ok()
    }

    /// Every channel that should observe commits to `(collection, document_id)`.
    pub fn for_document(collection: &str, document_id: &str) -> Vec<Channel> {
        match collection.split_once('_') {
            Some((RECORD_COLLECTION_PREFIX, table_id)) if !table_id.is_empty() => vec![
                Self::Record { table_id: table_id.to_string(), record_id: document_id.to_string() },
                Self::Table(table_id.to_string()),
            ],
            Some((VIEW_COLLECTION_PREFIX, table_id)) if !table_id.is_empty() => {
                vec![Self::View(document_id.to_string()), Self::Table(table_id.to_string())]
            }
            Some((_, table_id)) if !table_id.is_empty() => vec![Self::Table(table_id.to_string())],
            _ => vec![Self::Table(collection.to_string())],
        }
    }
}

/// `(resource_type, resource_id)` a write to `(collection, document_id)` is
/// authorized against.
pub fn resource_for_document(collection: &str, document_id: &str) -> (ResourceType, String) {
    match Channel::for_document(collection, document_id).into_iter().next() {
        Some(channel) => (channel.resource_type(), channel.resource_id()),
        None => (ResourceType::Table, collection.to_string()),
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(id) => write!(f, "table:{id}"),
            Self::Record { table_id, record_id } => write!(f, "record:{table_id}:{record_id}"),
            Self::View(id) => write!(f, "view:{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || ChannelParseError::Malformed(raw.to_string());
        let valid = |part: &str| !part.is_empty() && !part.contains(':');

        let (kind, rest) = raw.split_once(':').ok_or_else(malformed)?;
        match kind {
            "table" if valid(rest) => Ok(Self::Table(rest.to_string())),
            "view" if valid(rest) => Ok(Self::View(rest.to_string())),
            "record" => {
                let (table_id, record_id) = rest.split_once(':').ok_or_else(malformed)?;
                if valid(table_id) && valid(record_id) {
                    Ok(Self::Record {
                        table_id: table_id.to_string(),
                        record_id: record_id.to_string(),
                    })
                } else {
                    Err(malformed())
                }
            }
            "table" | "view" => Err(malformed()),
            _ => Err(ChannelParseError::UnknownKind(raw.to_string())),
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_all_kinds() {
        for raw in ["table:tbl1", "record:tbl1:rec9", "view:viw3"] {
            let channel: Channel = raw.parse().expect("channel should parse");
            assert_eq!(channel.to_string(), raw);
        }
    }

    #[test]
    fn rejects_malformed_channels() {
        assert!(matches!("table:".parse::<Channel>(), Err(ChannelParseError::Malformed(_))));
        assert!(matches!("record:t1".parse::<Channel>(), Err(ChannelParseError::Malformed(_))));
        assert!(matches!("record:t1:r1:x".parse::<Channel>(), Err(ChannelParseError::Malformed(_))));
        assert!(matches!("space:s1".parse::<Channel>(), Err(ChannelParseError::UnknownKind(_))));
        assert!(matches!("nocolon".parse::<Channel>(), Err(ChannelParseError::Malformed(_))));
    }

    #[test]
    fn document_channels_follow_collection_kind() {
        assert_eq!(
            Channel::for_document("rec_tbl1", "rec9"),
            vec![
                Channel::Record { table_id: "tbl1".into(), record_id: "rec9".into() },
                Channel::Table("tbl1".into()),
            ]
        );
        assert_eq!(
            Channel::for_document("viw_tbl1", "viw3"),
            vec![Channel::View("viw3".into()), Channel::Table("tbl1".into())]
        );
        assert_eq!(Channel::for_document("fld_tbl1", "fld2"), vec![Channel::Table("tbl1".into())]);
        assert_eq!(Channel::for_document("tables", "x"), vec![Channel::Table("tables".into())]);
    }

    #[test]
    fn resource_pair_maps_back_to_its_channel() {
        for raw in ["table:tbl1", "record:tbl1:rec9", "view:viw3"] {
            let channel: Channel = raw.parse().expect("channel should parse");
            let back = Channel::for_resource(&channel.resource_type(), &channel.resource_id());
            assert_eq!(back, Some(channel));
        }
        assert_eq!(Channel::for_resource(&ResourceType::Table, ""), None);
    }

    #[test]
    fn record_channel_maps_back_to_its_document() {
        let channel: Channel = "record:tbl1:rec9".parse().expect("channel should parse");
        assert_eq!(channel.document(), Some(("rec_tbl1".to_string(), "rec9".to_string())));
        assert_eq!(resource_for_document("rec_tbl1", "rec9"), (ResourceType::Record, "tbl1:rec9".into()));
    }
}
