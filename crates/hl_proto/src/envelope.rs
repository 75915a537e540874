//! Message envelope as tracked on both ends: status, edits, tombstones and
//! reactions around an opaque ciphertext.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthorizationError;
use crate::events::{ClientEvent, MessageType, RelayedMessage};

/// Delivery status. Ordered: transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Compare-and-set: move to `next` only if it is strictly ahead.
    /// Returns whether the status changed.
    pub fn advance(&mut self, next: MessageStatus) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: String,
    pub emoji: String,
}

/// Set of (user, emoji) pairs on one message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reactions(BTreeSet<Reaction>);

impl Reactions {
    pub fn add(&mut self, user_id: &str, emoji: &str) -> bool {
        self.0.insert(Reaction {
            user_id: user_id.to_string(),
            emoji: emoji.to_string(),
        })
    }

    pub fn remove(&mut self, user_id: &str, emoji: &str) -> bool {
        self.0.remove(&Reaction {
            user_id: user_id.to_string(),
            emoji: emoji.to_string(),
        })
    }

    pub fn contains(&self, user_id: &str, emoji: &str) -> bool {
        self.0.iter().any(|r| r.user_id == user_id && r.emoji == emoji)
    }

    pub fn count(&self, emoji: &str) -> usize {
        self.0.iter().filter(|r| r.emoji == emoji).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reaction> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub ciphertext: String,
    pub iv: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub is_edited: bool,
    pub is_deleted: bool,
    #[serde(default)]
    pub reactions: Reactions,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MessageEnvelope {
    pub fn from_relayed(msg: &RelayedMessage, status: MessageStatus) -> Self {
        Self {
            id: msg.id.clone(),
            chat_id: msg.chat_id.clone(),
            sender_id: msg.sender_id.clone(),
            recipient_id: msg.recipient_id.clone(),
            ciphertext: msg.ciphertext.clone(),
            iv: msg.iv.clone(),
            message_type: msg.message_type,
            status,
            is_edited: false,
            is_deleted: false,
            reactions: Reactions::default(),
            created_at: msg.created_at,
            edited_at: None,
            deleted_at: None,
        }
    }

    pub fn apply_status(&mut self, next: MessageStatus) -> bool {
        self.status.advance(next)
    }

    pub fn ensure_sender(&self, user_id: &str) -> Result<(), AuthorizationError> {
        if self.sender_id == user_id {
            Ok(())
        } else {
            Err(AuthorizationError {
                message_id: self.id.clone(),
                user_id: user_id.to_string(),
            })
        }
    }

    /// Replace the ciphertext. Tombstoned messages stay deleted.
    pub fn apply_edit(&mut self, ciphertext: String, iv: String, edited_at: DateTime<Utc>) -> bool {
        if self.is_deleted {
            return false;
        }
        self.ciphertext = ciphertext;
        self.iv = iv;
        self.is_edited = true;
        self.edited_at = Some(edited_at);
        true
    }

    /// Wipe the ciphertext and mark deleted. Idempotent.
    pub fn tombstone(&mut self, deleted_at: DateTime<Utc>) -> bool {
        if self.is_deleted {
            return false;
        }
        self.ciphertext.clear();
        self.iv.clear();
        self.is_deleted = true;
        self.deleted_at = Some(deleted_at);
        true
    }
}

/// An encrypted send waiting for a connection. Persisted until the relay
/// echoes it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub local_id: String,
    pub chat_id: String,
    pub recipient_id: String,
    pub ciphertext: String,
    pub iv: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedMessage {
    pub fn to_event(&self) -> ClientEvent {
        ClientEvent::EncryptedMessage {
            chat_id: self.chat_id.clone(),
            recipient_id: self.recipient_id.clone(),
            ciphertext: self.ciphertext.clone(),
            iv: self.iv.clone(),
            message_type: self.message_type,
            temp_id: self.local_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::from_relayed(
            &RelayedMessage {
                id: "m1".into(),
                chat_id: "c1".into(),
                sender_id: "alice".into(),
                recipient_id: "bob".into(),
                ciphertext: "Y3Q=".into(),
                iv: "aXY=".into(),
                message_type: MessageType::Text,
                temp_id: None,
                created_at: Utc::now(),
            },
            MessageStatus::Sent,
        )
    }

    #[test]
    fn status_never_regresses() {
        let mut env = envelope();
        assert!(env.apply_status(MessageStatus::Delivered));
        assert!(env.apply_status(MessageStatus::Read));
        assert!(!env.apply_status(MessageStatus::Delivered));
        assert_eq!(env.status, MessageStatus::Read);
        assert!(!env.apply_status(MessageStatus::Read));
    }

    #[test]
    fn read_may_skip_delivered() {
        let mut status = MessageStatus::Sent;
        assert!(status.advance(MessageStatus::Read));
        assert!(!status.advance(MessageStatus::Delivered));
        assert_eq!(status, MessageStatus::Read);
    }

    #[test]
    fn only_sender_is_authorised() {
        let env = envelope();
        assert!(env.ensure_sender("alice").is_ok());
        let err = env.ensure_sender("mallory").unwrap_err();
        assert_eq!(err.user_id, "mallory");
        assert_eq!(err.message_id, "m1");
    }

    #[test]
    fn tombstone_wipes_ciphertext_and_blocks_edits() {
        let mut env = envelope();
        assert!(env.tombstone(Utc::now()));
        assert!(env.ciphertext.is_empty());
        assert!(env.iv.is_empty());
        assert!(!env.tombstone(Utc::now()));
        assert!(!env.apply_edit("bmV3".into(), "aXYy".into(), Utc::now()));
        assert!(!env.is_edited);
    }

    #[test]
    fn reactions_are_a_set() {
        let mut r = Reactions::default();
        assert!(r.add("bob", "👍"));
        assert!(!r.add("bob", "👍"));
        assert!(r.add("carol", "👍"));
        assert_eq!(r.count("👍"), 2);
        assert!(r.remove("bob", "👍"));
        assert!(!r.remove("bob", "👍"));
        assert!(!r.contains("bob", "👍"));
        assert_eq!(r.len(), 1);
    }
}
