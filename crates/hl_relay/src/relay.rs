//! In-memory relay: authenticates sessions, stores opaque envelopes and fans
//! events out to connected users.
//!
//! The relay never sees plaintext. It tracks exactly what it needs to route:
//! who is connected, who is in which chat, published public keys, and per
//! message status/reactions. Status moves forward only, and only the
//! recipient can advance it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use hl_proto::{
    ClientEvent, ConnectError, Connection, Connector, MessageEnvelope, MessageStatus,
    MessageType, RelayedMessage, ServerEvent,
};

use crate::error::AuthError;
use crate::sessions::SessionRegistry;

type ConnId = u64;

#[derive(Default)]
struct RelayState {
    /// user -> open connections.
    connections: HashMap<String, HashMap<ConnId, mpsc::UnboundedSender<ServerEvent>>>,
    /// chat -> users who joined the room.
    rooms: HashMap<String, BTreeSet<String>>,
    /// chat -> users who have sent or been sent a message in it.
    participants: HashMap<String, BTreeSet<String>>,
    public_keys: HashMap<String, String>,
    messages: HashMap<String, StoredMessage>,
    /// Relay ids in arrival order.
    order: Vec<String>,
    /// (sender, temp id) -> relay id.
    temp_ids: HashMap<(String, String), String>,
}

struct StoredMessage {
    envelope: MessageEnvelope,
    temp_id: Option<String>,
}

impl StoredMessage {
    fn relayed(&self, temp_id: Option<String>) -> RelayedMessage {
        let env = &self.envelope;
        RelayedMessage {
            id: env.id.clone(),
            chat_id: env.chat_id.clone(),
            sender_id: env.sender_id.clone(),
            recipient_id: env.recipient_id.clone(),
            ciphertext: env.ciphertext.clone(),
            iv: env.iv.clone(),
            message_type: env.message_type,
            temp_id,
            created_at: env.created_at,
        }
    }
}

impl RelayState {
    fn is_online(&self, user_id: &str) -> bool {
        self.connections.get(user_id).is_some_and(|c| !c.is_empty())
    }

    fn send_to_user(&self, user_id: &str, event: &ServerEvent) {
        if let Some(conns) = self.connections.get(user_id) {
            for tx in conns.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    fn send_to_conn(&self, user_id: &str, conn: ConnId, event: ServerEvent) {
        if let Some(tx) = self.connections.get(user_id).and_then(|c| c.get(&conn)) {
            let _ = tx.send(event);
        }
    }

    /// Everyone who should see traffic for `chat_id`.
    fn audience(&self, chat_id: &str) -> BTreeSet<String> {
        let mut users = BTreeSet::new();
        if let Some(room) = self.rooms.get(chat_id) {
            users.extend(room.iter().cloned());
        }
        if let Some(parts) = self.participants.get(chat_id) {
            users.extend(parts.iter().cloned());
        }
        users
    }

    fn broadcast(&self, chat_id: &str, event: &ServerEvent, except: Option<&str>) {
        for user in self.audience(chat_id) {
            if Some(user.as_str()) != except {
                self.send_to_user(&user, event);
            }
        }
    }

    fn broadcast_presence(&self, user_id: &str, online: bool) {
        let event = if online {
            ServerEvent::UserOnline {
                user_id: user_id.to_string(),
            }
        } else {
            ServerEvent::UserOffline {
                user_id: user_id.to_string(),
            }
        };
        for other in self.connections.keys() {
            if other != user_id {
                self.send_to_user(other, &event);
            }
        }
    }

    fn can_see(&self, user_id: &str, env: &MessageEnvelope) -> bool {
        env.sender_id == user_id
            || env.recipient_id == user_id
            || self
                .rooms
                .get(&env.chat_id)
                .is_some_and(|room| room.contains(user_id))
    }
}

struct Inner {
    sessions: Arc<SessionRegistry>,
    state: Mutex<RelayState>,
    available: AtomicBool,
    next_conn: AtomicU64,
}

/// Cheap to clone; all clones share the same relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Relay {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions,
                state: Mutex::new(RelayState::default()),
                available: AtomicBool::new(true),
                next_conn: AtomicU64::new(1),
            }),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        self.inner.sessions.authenticate(token)
    }

    /// Register a connection for an already authenticated user and start
    /// handling its events.
    pub fn open_session(&self, user_id: &str) -> Connection {
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerEvent>();

        {
            let mut st = self.inner.state.lock();
            let first = !st.is_online(user_id);
            for (other, conns) in &st.connections {
                if other != user_id && !conns.is_empty() {
                    let _ = server_tx.send(ServerEvent::UserOnline {
                        user_id: other.clone(),
                    });
                }
            }
            st.connections
                .entry(user_id.to_string())
                .or_default()
                .insert(conn_id, server_tx);
            if first {
                st.broadcast_presence(user_id, true);
            }
        }
        tracing::info!(user = %user_id, conn = conn_id, "session opened");

        let relay = self.clone();
        let user = user_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = client_rx.recv().await {
                relay.handle(&user, conn_id, event);
            }
            relay.close_session(&user, conn_id);
        });

        Connection {
            user_id: user_id.to_string(),
            outbound: client_tx,
            inbound: server_rx,
        }
    }

    fn close_session(&self, user_id: &str, conn_id: ConnId) {
        let mut st = self.inner.state.lock();
        let Some(conns) = st.connections.get_mut(user_id) else {
            return;
        };
        if conns.remove(&conn_id).is_none() {
            return;
        }
        if conns.is_empty() {
            st.connections.remove(user_id);
            st.broadcast_presence(user_id, false);
        }
        tracing::info!(user = %user_id, conn = conn_id, "session closed");
    }

    /// Drop every connection of `user_id`. Returns how many were closed.
    pub fn disconnect_user(&self, user_id: &str) -> usize {
        let mut st = self.inner.state.lock();
        let closed = st.connections.remove(user_id).map_or(0, |c| c.len());
        if closed > 0 {
            st.broadcast_presence(user_id, false);
            tracing::info!(user = %user_id, closed, "user disconnected by relay");
        }
        closed
    }

    /// While unavailable, new connections fail with a network error.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.state.lock().is_online(user_id)
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .get(user_id)
            .map_or(0, |c| c.len())
    }

    pub fn public_key(&self, user_id: &str) -> Option<String> {
        self.inner.state.lock().public_keys.get(user_id).cloned()
    }

    pub fn message(&self, message_id: &str) -> Option<MessageEnvelope> {
        self.inner
            .state
            .lock()
            .messages
            .get(message_id)
            .map(|m| m.envelope.clone())
    }

    /// Stored messages of one chat, in arrival order.
    pub fn chat_messages(&self, chat_id: &str) -> Vec<MessageEnvelope> {
        let st = self.inner.state.lock();
        st.order
            .iter()
            .filter_map(|id| st.messages.get(id))
            .filter(|m| m.envelope.chat_id == chat_id)
            .map(|m| m.envelope.clone())
            .collect()
    }

    pub fn room_members(&self, chat_id: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .rooms
            .get(chat_id)
            .map(|room| room.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        self.inner.state.lock().messages.len()
    }

    fn handle(&self, user_id: &str, conn: ConnId, event: ClientEvent) {
        tracing::trace!(user = %user_id, event = event.name(), "client event");
        let mut st = self.inner.state.lock();
        match event {
            ClientEvent::RegisterPublicKey { public_key } => {
                tracing::debug!(user = %user_id, "public key registered");
                st.public_keys.insert(user_id.to_string(), public_key);
            }
            ClientEvent::RequestPublicKey { recipient_id } => {
                let public_key = st.public_keys.get(&recipient_id).cloned();
                st.send_to_conn(
                    user_id,
                    conn,
                    ServerEvent::PublicKeyResponse {
                        recipient_id,
                        public_key,
                    },
                );
            }
            ClientEvent::EncryptedMessage {
                chat_id,
                recipient_id,
                ciphertext,
                iv,
                message_type,
                temp_id,
            } => store_and_fanout(
                &mut st,
                user_id,
                chat_id,
                recipient_id,
                ciphertext,
                iv,
                message_type,
                temp_id,
            ),
            ClientEvent::Typing { chat_id } => {
                let event = ServerEvent::UserTyping {
                    user_id: user_id.to_string(),
                    chat_id: chat_id.clone(),
                };
                st.broadcast(&chat_id, &event, Some(user_id));
            }
            ClientEvent::StoppedTyping { chat_id } => {
                let event = ServerEvent::UserStoppedTyping {
                    user_id: user_id.to_string(),
                    chat_id: chat_id.clone(),
                };
                st.broadcast(&chat_id, &event, Some(user_id));
            }
            ClientEvent::MessageDelivered { message_id } => {
                advance_status(&mut st, user_id, conn, &message_id, MessageStatus::Delivered)
            }
            ClientEvent::MessageRead { message_id, .. } => {
                advance_status(&mut st, user_id, conn, &message_id, MessageStatus::Read)
            }
            ClientEvent::AddReaction { message_id, emoji } => {
                react(&mut st, user_id, conn, message_id, emoji, true)
            }
            ClientEvent::RemoveReaction { message_id, emoji } => {
                react(&mut st, user_id, conn, message_id, emoji, false)
            }
            ClientEvent::EditMessage {
                message_id,
                ciphertext,
                iv,
            } => {
                let edited_at = Utc::now();
                let event = match st.messages.get_mut(&message_id) {
                    None => Err(format!("unknown message {message_id}")),
                    Some(m) if m.envelope.sender_id != user_id => {
                        Err(format!("only the sender may edit message {message_id}"))
                    }
                    Some(m) => {
                        if m.envelope.apply_edit(ciphertext.clone(), iv.clone(), edited_at) {
                            Ok(ServerEvent::MessageEdited {
                                message_id: message_id.clone(),
                                chat_id: m.envelope.chat_id.clone(),
                                ciphertext,
                                iv,
                                edited_at,
                            })
                        } else {
                            Err(format!("message {message_id} is deleted"))
                        }
                    }
                };
                publish(&st, user_id, conn, event);
            }
            ClientEvent::DeleteMessage { message_id } => {
                let deleted_at = Utc::now();
                let event = match st.messages.get_mut(&message_id) {
                    None => Err(format!("unknown message {message_id}")),
                    Some(m) if m.envelope.sender_id != user_id => {
                        Err(format!("only the sender may delete message {message_id}"))
                    }
                    Some(m) if m.envelope.is_deleted => Ok(None),
                    Some(m) => {
                        m.envelope.tombstone(deleted_at);
                        Ok(Some(ServerEvent::MessageDeleted {
                            message_id: message_id.clone(),
                            chat_id: m.envelope.chat_id.clone(),
                            deleted_at,
                        }))
                    }
                };
                match event {
                    Ok(Some(event)) => publish(&st, user_id, conn, Ok(event)),
                    Ok(None) => {}
                    Err(message) => publish(&st, user_id, conn, Err(message)),
                }
            }
            ClientEvent::JoinChat { chat_id } => {
                st.rooms
                    .entry(chat_id.clone())
                    .or_default()
                    .insert(user_id.to_string());
                tracing::debug!(user = %user_id, %chat_id, "joined chat");
            }
            ClientEvent::LeaveChat { chat_id } => {
                if let Some(room) = st.rooms.get_mut(&chat_id) {
                    room.remove(user_id);
                    if room.is_empty() {
                        st.rooms.remove(&chat_id);
                    }
                }
                tracing::debug!(user = %user_id, %chat_id, "left chat");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn store_and_fanout(
    st: &mut RelayState,
    sender_id: &str,
    chat_id: String,
    recipient_id: String,
    ciphertext: String,
    iv: String,
    message_type: MessageType,
    temp_id: String,
) {
    let dedup_key = (sender_id.to_string(), temp_id.clone());
    if let Some(existing) = st.temp_ids.get(&dedup_key) {
        // Resend after a reconnect: echo again, store once.
        if let Some(stored) = st.messages.get(existing) {
            tracing::debug!(message_id = %existing, %temp_id, "duplicate send, echo only");
            let echo = ServerEvent::EncryptedMessage(stored.relayed(stored.temp_id.clone()));
            st.send_to_user(sender_id, &echo);
        }
        return;
    }

    let id = Uuid::new_v4().to_string();
    let relayed = RelayedMessage {
        id: id.clone(),
        chat_id: chat_id.clone(),
        sender_id: sender_id.to_string(),
        recipient_id: recipient_id.clone(),
        ciphertext,
        iv,
        message_type,
        temp_id: Some(temp_id.clone()),
        created_at: Utc::now(),
    };
    let stored = StoredMessage {
        envelope: MessageEnvelope::from_relayed(&relayed, MessageStatus::Sent),
        temp_id: Some(temp_id),
    };

    let parts = st.participants.entry(chat_id.clone()).or_default();
    parts.insert(sender_id.to_string());
    parts.insert(recipient_id);

    st.temp_ids.insert(dedup_key, id.clone());
    st.messages.insert(id.clone(), stored);
    st.order.push(id.clone());
    tracing::debug!(message_id = %id, %chat_id, sender = %sender_id, "message stored");

    let echo = ServerEvent::EncryptedMessage(relayed.clone());
    let copy = ServerEvent::EncryptedMessage(RelayedMessage {
        temp_id: None,
        ..relayed
    });
    for user in st.audience(&chat_id) {
        if user == sender_id {
            st.send_to_user(&user, &echo);
        } else {
            st.send_to_user(&user, &copy);
        }
    }
}

fn advance_status(
    st: &mut RelayState,
    user_id: &str,
    conn: ConnId,
    message_id: &str,
    status: MessageStatus,
) {
    let Some(stored) = st.messages.get_mut(message_id) else {
        st.send_to_conn(user_id, conn, ServerEvent::error(format!("unknown message {message_id}")));
        return;
    };
    let env = &mut stored.envelope;
    if env.recipient_id != user_id {
        tracing::debug!(%message_id, user = %user_id, ?status, "status ack from non-recipient ignored");
        return;
    }
    if !env.apply_status(status) {
        return;
    }
    let chat_id = env.chat_id.clone();
    let sender_id = env.sender_id.clone();
    let event = match status {
        MessageStatus::Read => ServerEvent::MessageRead {
            message_id: message_id.to_string(),
            chat_id,
            read_by: user_id.to_string(),
        },
        _ => ServerEvent::MessageDelivered {
            message_id: message_id.to_string(),
            chat_id,
        },
    };
    st.send_to_user(&sender_id, &event);
    st.send_to_user(user_id, &event);
}

fn react(
    st: &mut RelayState,
    user_id: &str,
    conn: ConnId,
    message_id: String,
    emoji: String,
    added: bool,
) {
    let visible = st
        .messages
        .get(&message_id)
        .map(|m| (st.can_see(user_id, &m.envelope), m.envelope.is_deleted));
    let event = match visible {
        None => Err(format!("unknown message {message_id}")),
        Some((false, _)) => Err(format!("not a participant of message {message_id}")),
        Some((true, true)) => Err(format!("message {message_id} is deleted")),
        Some((true, false)) => {
            let Some(stored) = st.messages.get_mut(&message_id) else {
                return;
            };
            let reactions = &mut stored.envelope.reactions;
            let changed = if added {
                reactions.add(user_id, &emoji)
            } else {
                reactions.remove(user_id, &emoji)
            };
            if !changed {
                return;
            }
            let user_id = user_id.to_string();
            Ok(if added {
                ServerEvent::ReactionAdded {
                    message_id,
                    user_id,
                    emoji,
                }
            } else {
                ServerEvent::ReactionRemoved {
                    message_id,
                    user_id,
                    emoji,
                }
            })
        }
    };
    publish(st, user_id, conn, event);
}

/// Broadcast a message-scoped event to its chat, or report the error back to
/// the originating connection.
fn publish(st: &RelayState, user_id: &str, conn: ConnId, event: Result<ServerEvent, String>) {
    match event {
        Ok(event) => {
            let chat_id = match &event {
                ServerEvent::MessageEdited { chat_id, .. }
                | ServerEvent::MessageDeleted { chat_id, .. } => Some(chat_id.clone()),
                ServerEvent::ReactionAdded { message_id, .. }
                | ServerEvent::ReactionRemoved { message_id, .. } => st
                    .messages
                    .get(message_id)
                    .map(|m| m.envelope.chat_id.clone()),
                _ => None,
            };
            if let Some(chat_id) = chat_id {
                st.broadcast(&chat_id, &event, None);
            }
        }
        Err(message) => {
            tracing::debug!(user = %user_id, %message, "rejected client event");
            st.send_to_conn(user_id, conn, ServerEvent::error(message));
        }
    }
}

#[async_trait]
impl Connector for Relay {
    async fn connect(&self, token: &str) -> Result<Connection, ConnectError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(ConnectError::Network("relay unavailable".into()));
        }
        let user_id = self
            .authenticate(token)
            .map_err(|e| ConnectError::Unauthorized(e.to_string()))?;
        Ok(self.open_session(&user_id))
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("Relay")
            .field("online", &st.connections.len())
            .field("messages", &st.messages.len())
            .field("rooms", &st.rooms.len())
            .finish()
    }
}
