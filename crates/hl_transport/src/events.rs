//! Notifications from the transport to its owner (UI, tests).

use hl_crypto::CryptoError;
use hl_proto::{MessageEnvelope, MessageStatus};
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { user_id: String },
    Disconnected { reconnecting: bool },
    /// The relay refused the token. The session stays offline.
    AuthRejected { reason: String },
    /// Reconnection gave up after the configured number of attempts.
    ReconnectExhausted { attempts: u32 },

    ChannelEstablished { peer_id: String },

    /// Own send acknowledged by the relay; `message_id` replaces `local_id`.
    MessageSent { local_id: String, message_id: String },
    StatusChanged { message_id: String, status: MessageStatus },

    MessageReceived {
        envelope: MessageEnvelope,
        plaintext: Zeroizing<Vec<u8>>,
    },
    /// An inbound message or edit that could not be decrypted. Never retried.
    Undecryptable {
        message_id: String,
        chat_id: String,
        sender_id: String,
        reason: CryptoError,
    },
    MessageEdited {
        message_id: String,
        chat_id: String,
        plaintext: Zeroizing<Vec<u8>>,
    },
    MessageDeleted { message_id: String, chat_id: String },

    ReactionAdded { message_id: String, user_id: String, emoji: String },
    ReactionRemoved { message_id: String, user_id: String, emoji: String },

    TypingStarted { chat_id: String, user_id: String },
    /// `expired` is true when no stop signal arrived in time.
    TypingStopped { chat_id: String, user_id: String, expired: bool },

    PresenceChanged { user_id: String, online: bool },

    RelayError { message: String },
}
