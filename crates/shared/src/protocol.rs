use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{MessageId, PresenceEntry, UserId};

/// One reaction attached to a confirmed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub username: String,
    pub reaction: String,
}

/// A message as the backend represents it, both in `GET /messages`
/// responses and inside live `message` frames. When the record confirms a
/// client-originated send the backend echoes `local_id` back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<Uuid>,
    pub sender_id: UserId,
    pub username: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Vec<ReactionRecord>,
}

/// Frames the client emits over the live transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "join-room")]
    JoinRoom { room: String },
    #[serde(rename = "message")]
    Message {
        id: Uuid,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
    },
    #[serde(rename = "typing")]
    Typing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
    },
    #[serde(rename = "stopTyping")]
    StopTyping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<UserId>,
    },
    #[serde(rename = "react")]
    React {
        message_id: MessageId,
        reaction: String,
    },
}

/// Frames the backend pushes over the live transport. Parsed and validated
/// at the connection boundary; anything that does not decode is discarded
/// there and never reaches the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "message")]
    Message(MessageRecord),
    #[serde(rename = "online-users")]
    OnlineUsers(Vec<PresenceEntry>),
    #[serde(rename = "chat-cleared")]
    ChatCleared,
    #[serde(rename = "typing")]
    Typing(String),
    #[serde(rename = "stopTyping")]
    StopTyping,
    #[serde(rename = "newReaction")]
    NewReaction {
        message_id: MessageId,
        reaction: String,
        username: String,
    },
    #[serde(rename = "connect-error")]
    ConnectError { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Error body the auth endpoints return alongside a non-success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_use_wire_event_names() {
        let frame = ClientFrame::StopTyping { recipient_id: None };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "stopTyping");

        let frame = ClientFrame::Message {
            id: Uuid::new_v4(),
            content: "hello".into(),
            recipient_id: Some(UserId(4)),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "message");
        assert_eq!(value["data"]["recipient_id"], 4);
    }

    #[test]
    fn server_frame_without_payload_decodes() {
        let frame: ServerFrame = serde_json::from_str(r#"{"event":"chat-cleared"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::ChatCleared));
    }

    #[test]
    fn message_record_tolerates_missing_optional_fields() {
        let raw = r#"{
            "id": 12,
            "sender_id": 3,
            "username": "alice",
            "content": "hi",
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let record: MessageRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.id, MessageId(12));
        assert!(record.local_id.is_none());
        assert!(record.recipient_id.is_none());
        assert!(record.reactions.is_empty());
    }

    #[test]
    fn malformed_frame_is_a_decode_error() {
        assert!(serde_json::from_str::<ServerFrame>(r#"{"event":"no-such-event"}"#).is_err());
        assert!(serde_json::from_str::<ServerFrame>("not json").is_err());
    }
}
