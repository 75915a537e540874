//! Events exchanged with the relay over a persistent connection.
//!
//! Every event serialises as `{"event": "<snake_case name>", "data": {...}}`
//! with camelCase payload fields. Ciphertext and IVs are standard base64 and
//! are never inspected by the relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    RegisterPublicKey { public_key: String },

    #[serde(rename_all = "camelCase")]
    RequestPublicKey { recipient_id: String },

    #[serde(rename_all = "camelCase")]
    EncryptedMessage {
        chat_id: String,
        recipient_id: String,
        ciphertext: String,
        iv: String,
        message_type: MessageType,
        temp_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Typing { chat_id: String },

    #[serde(rename_all = "camelCase")]
    StoppedTyping { chat_id: String },

    #[serde(rename_all = "camelCase")]
    MessageDelivered { message_id: String },

    #[serde(rename_all = "camelCase")]
    MessageRead { message_id: String, chat_id: String },

    #[serde(rename_all = "camelCase")]
    AddReaction { message_id: String, emoji: String },

    #[serde(rename_all = "camelCase")]
    RemoveReaction { message_id: String, emoji: String },

    #[serde(rename_all = "camelCase")]
    EditMessage {
        message_id: String,
        ciphertext: String,
        iv: String,
    },

    #[serde(rename_all = "camelCase")]
    DeleteMessage { message_id: String },

    #[serde(rename_all = "camelCase")]
    JoinChat { chat_id: String },

    #[serde(rename_all = "camelCase")]
    LeaveChat { chat_id: String },
}

impl ClientEvent {
    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterPublicKey { .. } => "register_public_key",
            Self::RequestPublicKey { .. } => "request_public_key",
            Self::EncryptedMessage { .. } => "encrypted_message",
            Self::Typing { .. } => "typing",
            Self::StoppedTyping { .. } => "stopped_typing",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageRead { .. } => "message_read",
            Self::AddReaction { .. } => "add_reaction",
            Self::RemoveReaction { .. } => "remove_reaction",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::JoinChat { .. } => "join_chat",
            Self::LeaveChat { .. } => "leave_chat",
        }
    }
}

/// An opaque message as stored and fanned out by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedMessage {
    /// Relay-assigned message id.
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub ciphertext: String,
    pub iv: String,
    pub message_type: MessageType,
    /// Client-generated id echoed back to the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// `public_key` is `None` when the relay has no key for that user.
    #[serde(rename_all = "camelCase")]
    PublicKeyResponse {
        recipient_id: String,
        public_key: Option<String>,
    },

    EncryptedMessage(RelayedMessage),

    #[serde(rename_all = "camelCase")]
    UserTyping { user_id: String, chat_id: String },

    #[serde(rename_all = "camelCase")]
    UserStoppedTyping { user_id: String, chat_id: String },

    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: String },

    #[serde(rename_all = "camelCase")]
    UserOffline { user_id: String },

    #[serde(rename_all = "camelCase")]
    MessageDelivered { message_id: String, chat_id: String },

    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: String,
        chat_id: String,
        read_by: String,
    },

    #[serde(rename_all = "camelCase")]
    ReactionAdded {
        message_id: String,
        user_id: String,
        emoji: String,
    },

    #[serde(rename_all = "camelCase")]
    ReactionRemoved {
        message_id: String,
        user_id: String,
        emoji: String,
    },

    #[serde(rename_all = "camelCase")]
    MessageEdited {
        message_id: String,
        chat_id: String,
        ciphertext: String,
        iv: String,
        edited_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        message_id: String,
        chat_id: String,
        deleted_at: DateTime<Utc>,
    },

    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PublicKeyResponse { .. } => "public_key_response",
            Self::EncryptedMessage(_) => "encrypted_message",
            Self::UserTyping { .. } => "user_typing",
            Self::UserStoppedTyping { .. } => "user_stopped_typing",
            Self::UserOnline { .. } => "user_online",
            Self::UserOffline { .. } => "user_offline",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageRead { .. } => "message_read",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::ReactionRemoved { .. } => "reaction_removed",
            Self::MessageEdited { .. } => "message_edited",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_event_shape() {
        let ev = ClientEvent::MessageRead {
            message_id: "m1".into(),
            chat_id: "c1".into(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            v,
            json!({"event": "message_read", "data": {"messageId": "m1", "chatId": "c1"}})
        );
    }

    #[test]
    fn encrypted_message_parses_from_relay_json() {
        let raw = json!({
            "event": "encrypted_message",
            "data": {
                "id": "srv-1",
                "chatId": "c1",
                "senderId": "alice",
                "recipientId": "bob",
                "ciphertext": "AAAA",
                "iv": "BBBB",
                "messageType": "image",
                "tempId": "tmp-1",
                "createdAt": "2026-01-01T00:00:00Z"
            }
        });
        let ev: ServerEvent = serde_json::from_value(raw).unwrap();
        match ev {
            ServerEvent::EncryptedMessage(m) => {
                assert_eq!(m.sender_id, "alice");
                assert_eq!(m.message_type, MessageType::Image);
                assert_eq!(m.temp_id.as_deref(), Some("tmp-1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn temp_id_is_optional() {
        let raw = json!({
            "event": "encrypted_message",
            "data": {
                "id": "srv-1", "chatId": "c1", "senderId": "a", "recipientId": "b",
                "ciphertext": "", "iv": "", "messageType": "text",
                "createdAt": "2026-01-01T00:00:00Z"
            }
        });
        let ev: ServerEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(ev.name(), "encrypted_message");
    }

    #[test]
    fn missing_public_key_is_null() {
        let ev = ServerEvent::PublicKeyResponse {
            recipient_id: "bob".into(),
            public_key: None,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["data"]["publicKey"], serde_json::Value::Null);
    }
}
