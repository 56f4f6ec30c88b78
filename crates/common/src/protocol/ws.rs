// WebSocket envelope and message payloads for the tablesync protocol.
//
// Every frame is `{type, data, timestamp}`. `type` selects how `data` is read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::channel::{Channel, ResourceType};
use crate::ot::{Operation, Snapshot};

/// Raw wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WsEnvelope {
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self { message_type: message_type.as_str().to_string(), data, timestamp: Utc::now() }
    }
}

/// Every `type` value the relay sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    JoinChannel,
    LeaveChannel,
    PresenceUpdate,
    CursorUpdate,
    Ping,
    Pong,
    Submit,
    ChannelJoined,
    ChannelLeft,
    Snapshot,
    Collaboration,
    RecordChange,
    Notification,
    SubmitAck,
    Error,
    UnknownMessage,
}

impl MessageType {
    pub const ALL: [MessageType; 16] = [
        Self::JoinChannel,
        Self::LeaveChannel,
        Self::PresenceUpdate,
        Self::CursorUpdate,
        Self::Ping,
        Self::Pong,
        Self::Submit,
        Self::ChannelJoined,
        Self::ChannelLeft,
        Self::Snapshot,
        Self::Collaboration,
        Self::RecordChange,
        Self::Notification,
        Self::SubmitAck,
        Self::Error,
        Self::UnknownMessage,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JoinChannel => "join_channel",
            Self::LeaveChannel => "leave_channel",
            Self::PresenceUpdate => "presence_update",
            Self::CursorUpdate => "cursor_update",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Submit => "submit",
            Self::ChannelJoined => "channel_joined",
            Self::ChannelLeft => "channel_left",
            Self::Snapshot => "snapshot",
            Self::Collaboration => "collaboration",
            Self::RecordChange => "record_change",
            Self::Notification => "notification",
            Self::SubmitAck => "submit_ack",
            Self::Error => "error",
            Self::UnknownMessage => "unknown_message",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|candidate| candidate.as_str() == raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub channel: Channel,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub channel: Channel,
    pub cursor: CursorPosition,
}

/// `submit` over the socket: same body as `POST /submit` minus agent fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitPayload {
    pub collection: String,
    pub id: String,
    pub op: Operation,
}

/// Who is looking at what, and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub user_id: String,
    pub connection_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationAction {
    PresenceJoined,
    PresenceUpdate,
    CursorUpdate,
    PresenceLeft,
    PresenceList,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationPayload {
    pub action: CollaborationAction,
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<PresenceEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    pub collection: String,
    pub id: String,
    pub committed_version: u64,
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub channel: Channel,
    pub collection: String,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// Client -> server messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinChannel(ChannelRequest),
    LeaveChannel(ChannelRequest),
    PresenceUpdate(PresenceUpdate),
    CursorUpdate(CursorUpdate),
    Ping,
    Pong,
    Submit(SubmitPayload),
    /// A `type` this relay does not accept from clients.
    Unknown { received_type: String },
}

impl ClientMessage {
    pub fn from_envelope(envelope: WsEnvelope) -> Result<Self, serde_json::Error> {
        let WsEnvelope { message_type, data, .. } = envelope;
        let message = match MessageType::parse(&message_type) {
            Some(MessageType::JoinChannel) => Self::JoinChannel(serde_json::from_value(data)?),
            Some(MessageType::LeaveChannel) => Self::LeaveChannel(serde_json::from_value(data)?),
            Some(MessageType::PresenceUpdate) => Self::PresenceUpdate(serde_json::from_value(data)?),
            Some(MessageType::CursorUpdate) => Self::CursorUpdate(serde_json::from_value(data)?),
            Some(MessageType::Ping) => Self::Ping,
            Some(MessageType::Pong) => Self::Pong,
            Some(MessageType::Submit) => Self::Submit(serde_json::from_value(data)?),
            _ => Self::Unknown { received_type: message_type },
        };
        Ok(message)
    }

    pub fn to_envelope(&self) -> Result<WsEnvelope, serde_json::Error> {
        let (message_type, data) = match self {
            Self::JoinChannel(request) => (MessageType::JoinChannel, serde_json::to_value(request)?),
            Self::LeaveChannel(request) => (MessageType::LeaveChannel, serde_json::to_value(request)?),
            Self::PresenceUpdate(update) => (MessageType::PresenceUpdate, serde_json::to_value(update)?),
            Self::CursorUpdate(update) => (MessageType::CursorUpdate, serde_json::to_value(update)?),
            Self::Ping => (MessageType::Ping, Value::Object(Default::default())),
            Self::Pong => (MessageType::Pong, Value::Object(Default::default())),
            Self::Submit(payload) => (MessageType::Submit, serde_json::to_value(payload)?),
            Self::Unknown { received_type } => {
                return Ok(WsEnvelope {
                    message_type: received_type.clone(),
                    data: Value::Object(Default::default()),
                    timestamp: Utc::now(),
                })
            }
        };
        Ok(WsEnvelope::new(message_type, data))
    }
}

/// Server -> client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ChannelJoined { channel: Channel, connection_id: Uuid },
    ChannelLeft { channel: Channel },
    Snapshot(SnapshotPayload),
    Pong,
    Collaboration(CollaborationPayload),
    RecordChange(RecordChange),
    Notification(Value),
    SubmitAck { collection: String, id: String, committed_version: u64 },
    Error(ErrorPayload),
    UnknownMessage { received_type: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Error(ErrorPayload { code: code.into(), message: message.into(), retryable })
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ChannelJoined { .. } => MessageType::ChannelJoined,
            Self::ChannelLeft { .. } => MessageType::ChannelLeft,
            Self::Snapshot(_) => MessageType::Snapshot,
            Self::Pong => MessageType::Pong,
            Self::Collaboration(_) => MessageType::Collaboration,
            Self::RecordChange(_) => MessageType::RecordChange,
            Self::Notification(_) => MessageType::Notification,
            Self::SubmitAck { .. } => MessageType::SubmitAck,
            Self::Error(_) => MessageType::Error,
            Self::UnknownMessage { .. } => MessageType::UnknownMessage,
        }
    }

    /// Pushes a slow consumer may lose without falling out of sync.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Collaboration(_) | Self::Notification(_))
    }

    pub fn to_envelope(&self) -> Result<WsEnvelope, serde_json::Error> {
        let data = match self {
            Self::ChannelJoined { channel, connection_id } => {
                serde_json::json!({ "channel": channel, "connection_id": connection_id })
            }
            Self::ChannelLeft { channel } => serde_json::json!({ "channel": channel }),
            Self::Snapshot(payload) => serde_json::to_value(payload)?,
            Self::Pong => Value::Object(Default::default()),
            Self::Collaboration(payload) => serde_json::to_value(payload)?,
            Self::RecordChange(change) => serde_json::to_value(change)?,
            Self::Notification(payload) => payload.clone(),
            Self::SubmitAck { collection, id, committed_version } => serde_json::json!({
                "collection": collection,
                "id": id,
                "committed_version": committed_version,
            }),
            Self::Error(payload) => serde_json::to_value(payload)?,
            Self::UnknownMessage { received_type } => {
                serde_json::json!({ "received_type": received_type })
            }
        };
        Ok(WsEnvelope::new(self.message_type(), data))
    }
}

pub fn decode_envelope(raw: &str) -> Result<WsEnvelope, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn encode_envelope(envelope: &WsEnvelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}
